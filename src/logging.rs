// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;
use std::io::Write;

use log::{self, Level, LevelFilter, Log, Metadata, Record};

static LOGGER: SimpleLogger = SimpleLogger;

/// Install the logger. Safe to call more than once.
pub fn init() {
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    let level = std::env::var("LOG").ok();
    log::set_max_level(level_filter(level.as_deref().or(option_env!("LOG"))));
}

fn level_filter(level: Option<&str>) -> LevelFilter {
    match level {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Add escape sequence to print with color in Linux console
macro_rules! with_color {
    ($args: ident, $color_code: ident) => {{
        format_args!("\u{1B}[{}m{}\u{1B}[0m", $color_code as u8, $args)
    }};
}

fn print_in_color(args: fmt::Arguments, color_code: u8) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = out.write_fmt(with_color!(args, color_code));
}

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let thread = std::thread::current();
        print_in_color(
            format_args!(
                "[{}][{}] {}\n",
                record.level(),
                thread.name().unwrap_or("-"),
                record.args(),
            ),
            level_to_color_code(record.level()),
        );
    }
    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(Some("warn")), LevelFilter::Warn);
        assert_eq!(level_filter(Some("trace")), LevelFilter::Trace);
        assert_eq!(level_filter(Some("verbose")), LevelFilter::Off);
        assert_eq!(level_filter(None), LevelFilter::Off);
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
        info!("logger installed");
    }
}
