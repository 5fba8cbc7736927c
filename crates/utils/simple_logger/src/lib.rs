//! 一个简单的 `log` 后端，把日志带颜色地写到调用者给出的控制台函数里

#![cfg_attr(not(test), no_std)]

use core::fmt;

use klocks::Once;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// 控制台输出函数，内核里一般是串口，测试里是 `println!`
pub type ConsoleWrite = fn(fmt::Arguments<'_>);

struct SimpleLogger {
    level: LevelFilter,
    console: ConsoleWrite,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        (self.console)(format_args!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
            color,
            record.level(),
            record.args(),
        ));
    }

    fn flush(&self) {}
}

fn level_from_env() -> LevelFilter {
    parse_level(option_env!("VM_LOG"))
}

fn parse_level(level: Option<&str>) -> LevelFilter {
    match level {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

static LOGGER: Once<SimpleLogger> = Once::new();

/// 初始化日志。可重复调用，只有第一次生效
pub fn init(console: ConsoleWrite) {
    let logger = LOGGER.call_once(|| SimpleLogger {
        level: level_from_env(),
        console,
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
}
