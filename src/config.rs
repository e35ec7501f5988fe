use std::fmt;
use std::path::{Path, PathBuf};

use clap::Parser;
use ini::{Ini, ParseOption, Properties};

/// Section holding the backup naming rules
pub const GENERAL_SECTION: &str = "General";
/// Section holding the database connection
pub const MYSQL_SECTION: &str = "MySQL";
/// Section holding the remote store connection
pub const SFTP_SECTION: &str = "SFTP";

const DEFAULT_SFTP_PORT: u16 = 22;
const DEFAULT_DUMP_COMMAND: &str = "mysqldump";

/// Configuration file keys
pub mod keys {
    pub const USERNAME: &str = "USERNAME";
    pub const PASSWORD: &str = "PASSWORD";
    pub const HOST: &str = "HOST";
    pub const PORT: &str = "PORT";
    pub const DB_NAME: &str = "DB_NAME";
    pub const DUMP_COMMAND: &str = "DUMP_COMMAND";
    pub const FOLDER: &str = "FOLDER";
    pub const FILENAME_FORMAT: &str = "BACKUP_FILENAME_FORMAT";
    pub const DATE_FORMAT: &str = "BACKUP_DATE_FORMAT";
    pub const DATE_REGEX: &str = "BACKUP_DATE_REGEX";
    pub const DBNAME_REGEX: &str = "BACKUP_DBNAME_REGEX";
}

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mysql-sftp-backup",
    about = "Dump a MySQL database to an SFTP server and prune old backups"
)]
pub struct BackupArgs {
    /// Config file with passwords and usernames
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Number of backups to leave on the server
    #[arg(
        short = 'n',
        long = "number-of-backups",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub number_of_backups: u32,
}

/// Errors raised while loading the configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("missing section [{0}]")]
    MissingSection(&'static str),

    #[error("missing key {key} in section [{section}]")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },

    #[error("invalid value for {key} in section [{section}]: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
}

/// A credential that never shows up in logs or debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw credential, for handing to the process or transport that needs it
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("******")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("******")
    }
}

/// Naming rules shared by new backups and the retention scan
#[derive(Debug, Clone, PartialEq)]
pub struct NamingConfig {
    /// Template containing `{dbname}` and `{date}` placeholders
    pub filename_format: String,
    /// strftime-style format of the `{date}` token
    pub date_format: String,
    /// Regex fragment matched by the `{date}` slot
    pub date_regex: String,
    /// Regex fragment matched by the `{dbname}` slot
    pub dbname_regex: String,
}

/// Connection settings for the database being dumped
#[derive(Debug, Clone, PartialEq)]
pub struct MySqlConfig {
    pub username: String,
    pub password: Secret,
    pub host: String,
    pub port: u16,
    pub db_name: String,
    /// Dump executable, `mysqldump` unless overridden
    pub dump_command: String,
}

/// Connection settings for the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct SftpConfig {
    pub username: String,
    pub password: Secret,
    pub host: String,
    pub port: u16,
    /// Remote folder holding the backups
    pub folder: String,
}

/// Immutable run configuration, loaded once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub naming: NamingConfig,
    pub mysql: MySqlConfig,
    pub sftp: SftpConfig,
}

impl Config {
    /// Load the configuration from an INI file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ini = Ini::load_from_file_opt(path, raw_parse_option()).map_err(|source| {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::from_ini(&ini)
    }

    /// Load the configuration from INI text
    pub fn from_ini_str(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str_opt(content, raw_parse_option())?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let general = Section::new(ini, GENERAL_SECTION)?;
        let naming = NamingConfig {
            filename_format: general.required(keys::FILENAME_FORMAT)?,
            date_format: general.required(keys::DATE_FORMAT)?,
            date_regex: general.required(keys::DATE_REGEX)?,
            dbname_regex: general.required(keys::DBNAME_REGEX)?,
        };

        let mysql = Section::new(ini, MYSQL_SECTION)?;
        let mysql = MySqlConfig {
            username: mysql.required(keys::USERNAME)?,
            password: Secret::new(mysql.required(keys::PASSWORD)?),
            host: mysql.required(keys::HOST)?,
            port: mysql.port(keys::PORT)?,
            db_name: mysql.required(keys::DB_NAME)?,
            dump_command: mysql
                .optional(keys::DUMP_COMMAND)
                .unwrap_or_else(|| DEFAULT_DUMP_COMMAND.to_string()),
        };

        let sftp = Section::new(ini, SFTP_SECTION)?;
        let sftp = SftpConfig {
            username: sftp.required(keys::USERNAME)?,
            password: Secret::new(sftp.required(keys::PASSWORD)?),
            host: sftp.required(keys::HOST)?,
            port: match sftp.optional(keys::PORT) {
                Some(_) => sftp.port(keys::PORT)?,
                None => DEFAULT_SFTP_PORT,
            },
            folder: sftp.required(keys::FOLDER)?,
        };

        Ok(Self {
            naming,
            mysql,
            sftp,
        })
    }
}

// Regexes and passwords are taken verbatim, so quote and escape handling is off
fn raw_parse_option() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    }
}

struct Section<'a> {
    name: &'static str,
    properties: &'a Properties,
}

impl<'a> Section<'a> {
    fn new(ini: &'a Ini, name: &'static str) -> Result<Self, ConfigError> {
        let properties = ini
            .section(Some(name))
            .ok_or(ConfigError::MissingSection(name))?;
        Ok(Self { name, properties })
    }

    // Option names are case-insensitive, section names are not
    fn optional(&self, key: &'static str) -> Option<String> {
        self.properties
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.to_string())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::MissingKey {
            section: self.name,
            key,
        })
    }

    fn port(&self, key: &'static str) -> Result<u16, ConfigError> {
        let value = self.required(key)?;
        value
            .trim()
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidValue {
                section: self.name,
                key,
                reason: format!("{:?} is not a valid port: {}", value, e),
            })
    }
}
