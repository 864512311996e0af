use std::collections::BTreeMap;

use indoc::formatdoc;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const LOG4J_CONFIG_FILE: &str = "log4j.properties";
pub const KAFKA_LOG_FILE: &str = "kafka.log4j.xml";
pub const MAX_KAFKA_LOG_FILES_SIZE_MIB: u32 = 10;

const CONSOLE_CONVERSION_PATTERN: &str = "[%d] %p %m (%c)%n";

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    None,
}

impl LogLevel {
    /// log4j spells "nothing" as `OFF`.
    pub fn to_log4j_literal(&self) -> String {
        match self {
            LogLevel::None => "OFF".to_string(),
            level => level.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub root_level: LogLevel,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    /// Per-logger levels, e.g. `kafka.controller: DEBUG`.
    #[serde(default)]
    pub loggers: BTreeMap<String, LogLevel>,
}

/// Render the Kafka `log4j.properties`: console output plus a size-bounded rolling XML file.
pub fn create_log4j_config(log_dir: &str, log_file: &str, config: &LoggingConfig) -> String {
    let loggers = config
        .loggers
        .iter()
        .map(|(name, level)| {
            format!(
                "log4j.logger.{name}={level}\n",
                level = level.to_log4j_literal()
            )
        })
        .collect::<String>();

    formatdoc! {"
        log4j.rootLogger={root_level}, CONSOLE, FILE

        log4j.appender.CONSOLE=org.apache.log4j.ConsoleAppender
        log4j.appender.CONSOLE.Threshold={console_level}
        log4j.appender.CONSOLE.layout=org.apache.log4j.PatternLayout
        log4j.appender.CONSOLE.layout.ConversionPattern={CONSOLE_CONVERSION_PATTERN}

        log4j.appender.FILE=org.apache.log4j.RollingFileAppender
        log4j.appender.FILE.Threshold={file_level}
        log4j.appender.FILE.File={log_dir}/{log_file}
        log4j.appender.FILE.MaxFileSize={max_size}MB
        log4j.appender.FILE.MaxBackupIndex=1
        log4j.appender.FILE.layout=org.apache.log4j.xml.XMLLayout

        {loggers}",
        root_level = config.root_level.to_log4j_literal(),
        console_level = config.console_level.to_log4j_literal(),
        file_level = config.file_level.to_log4j_literal(),
        // one current and one backup file share the budget
        max_size = MAX_KAFKA_LOG_FILES_SIZE_MIB / 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log4j_config() {
        let config = LoggingConfig {
            root_level: LogLevel::Warn,
            loggers: BTreeMap::from([
                ("kafka.controller".to_string(), LogLevel::Debug),
                ("state.change.logger".to_string(), LogLevel::None),
            ]),
            ..LoggingConfig::default()
        };

        let rendered = create_log4j_config("/var/log/kafka", KAFKA_LOG_FILE, &config);

        assert!(rendered.starts_with("log4j.rootLogger=WARN, CONSOLE, FILE\n"));
        assert!(rendered.contains("log4j.appender.CONSOLE.Threshold=INFO\n"));
        assert!(rendered.contains("log4j.appender.FILE.File=/var/log/kafka/kafka.log4j.xml\n"));
        assert!(rendered.contains("log4j.appender.FILE.MaxFileSize=5MB\n"));
        assert!(rendered.contains("log4j.logger.kafka.controller=DEBUG\n"));
        assert!(rendered.contains("log4j.logger.state.change.logger=OFF\n"));
    }
}
