/// Configuration management for Trove
///
/// Everything comes from the environment (after loading `.env`). Sizes
/// accept `1024`, `512K`, `1.5G`, `10 GiB`; durations accept `90s`, `30m`,
/// `24h`, `7d` or bare seconds.
use crate::blob_store::{BlobBackendType, S3Config};
use crate::db::DatabaseOptions;
use crate::error::{TroveError, TroveResult};
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session secret used when none is configured; refused in production
pub const DEV_SESSION_SECRET: &str = "trove-development-secret-change-me";

const KIB: u64 = 1024;
const GIB: u64 = KIB * KIB * KIB;

/// Main server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub authentication: AuthConfig,
    pub retention: RetentionConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

/// Service-level configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub version: String,
}

/// Metadata database configuration
#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    Sqlite {
        path: PathBuf,
    },
    Postgres {
        url: String,
    },
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BlobBackendType,
    pub max_connections: u32,
    /// Scratch directory for upload spools
    pub temp_dir: PathBuf,
    /// Spools older than this are swept
    pub temp_max_age: Duration,
}

/// Size limits, quotas and deduplication
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub default_user_quota: u64,
    pub max_upload_size: u64,
    pub dedup_enabled: bool,
    /// Look for duplicates across all users instead of only the uploader's files
    pub dedup_cross_user: bool,
    /// Charge the full size of a deduplicated upload to its owner
    pub dedup_hits_count_quota: bool,
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub session_secret: String,
    pub session_duration: Duration,
    /// Password hashing work factor
    pub password_cost: u32,
    pub csrf_enabled: bool,
    pub registration_enabled: bool,
}

/// Soft-delete retention and cleanup
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Soft-deleted files keep counting against the owner's quota
    pub deleted_counts_quota: bool,
    pub deleted_retention_days: i64,
    pub cleanup_interval: Duration,
    /// Unfinished upload rows are reclaimed after this long
    pub failed_upload_retention: Duration,
}

/// HTTP front-end configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub trusted_proxies: Vec<IpCidr>,
    pub cors_allowed_origins: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> TroveResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> TroveResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let environment = match or("ENV", "development").to_ascii_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            "production" | "prod" => Environment::Production,
            other => {
                return Err(TroveError::Validation(format!("Invalid ENV: {}", other)));
            }
        };

        let port = or("PORT", "8080")
            .parse()
            .map_err(|_| TroveError::Validation("Invalid port number".to_string()))?;

        let database = match or("DB_TYPE", "sqlite").to_ascii_lowercase().as_str() {
            "sqlite" => DatabaseConfig::Sqlite {
                path: PathBuf::from(or("DB_PATH", "./data/trove.db")),
            },
            "postgres" | "postgresql" => {
                let url = match var("DATABASE_URL") {
                    Some(url) => url,
                    None => format!(
                        "postgres://{}:{}@{}:{}/{}?sslmode={}",
                        or("DB_USER", "trove"),
                        var("DB_PASSWORD").unwrap_or_default(),
                        or("DB_HOST", "localhost"),
                        or("DB_PORT", "5432"),
                        or("DB_NAME", "trove"),
                        or("DB_SSLMODE", "disable"),
                    ),
                };
                DatabaseConfig::Postgres { url }
            }
            other => {
                return Err(TroveError::Validation(format!("Invalid DB_TYPE: {}", other)));
            }
        };
        let max_connections = parse_number("DB_MAX_CONNECTIONS", &or("DB_MAX_CONNECTIONS", "10"))?;

        let backend = match or("STORAGE_BACKEND", "disk").to_ascii_lowercase().as_str() {
            "disk" | "local" => BlobBackendType::Disk {
                location: PathBuf::from(or("STORAGE_PATH", "./data/files")),
            },
            "memory" => BlobBackendType::Memory,
            "s3" => BlobBackendType::S3(S3Config {
                bucket: var("S3_BUCKET").ok_or_else(|| {
                    TroveError::Validation("S3_BUCKET is required for the s3 backend".to_string())
                })?,
                use_path_style: parse_bool("S3_USE_PATH_STYLE", &or("S3_USE_PATH_STYLE", "false"))?,
                prefix: var("S3_PREFIX").unwrap_or_default(),
            }),
            other => {
                return Err(TroveError::Validation(format!(
                    "Invalid STORAGE_BACKEND: {}",
                    other
                )));
            }
        };

        let temp_dir = var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("trove"));
        let temp_max_age =
            Duration::from_secs(60 * parse_number::<u64>("TEMP_MAX_AGE_MIN", &or("TEMP_MAX_AGE_MIN", "60"))?);

        let limits = LimitsConfig {
            default_user_quota: parse_size(&or("DEFAULT_USER_QUOTA", "10G"))?,
            max_upload_size: parse_size(&or("MAX_UPLOAD_SIZE", "5G"))?,
            dedup_enabled: parse_bool(
                "ENABLE_FILE_DEDUPLICATION",
                &or("ENABLE_FILE_DEDUPLICATION", "true"),
            )?,
            dedup_cross_user: parse_bool("DEDUP_CROSS_USER", &or("DEDUP_CROSS_USER", "false"))?,
            dedup_hits_count_quota: parse_bool(
                "DEDUP_HITS_COUNT_QUOTA",
                &or("DEDUP_HITS_COUNT_QUOTA", "true"),
            )?,
        };

        let authentication = AuthConfig {
            session_secret: or("SESSION_SECRET", DEV_SESSION_SECRET),
            session_duration: parse_duration(&or("SESSION_DURATION", "24h"))?,
            password_cost: parse_number("BCRYPT_COST", &or("BCRYPT_COST", "3"))?,
            csrf_enabled: parse_bool("CSRF_ENABLED", &or("CSRF_ENABLED", "true"))?,
            registration_enabled: parse_bool(
                "ENABLE_REGISTRATION",
                &or("ENABLE_REGISTRATION", "true"),
            )?,
        };

        let retention = RetentionConfig {
            deleted_counts_quota: parse_bool(
                "DELETED_COUNTS_QUOTA",
                &or("DELETED_COUNTS_QUOTA", "true"),
            )?,
            deleted_retention_days: parse_number(
                "DELETED_RETENTION_DAYS",
                &or("DELETED_RETENTION_DAYS", "30"),
            )?,
            cleanup_interval: Duration::from_secs(
                60 * parse_number::<u64>(
                    "DELETED_CLEANUP_INTERVAL_MIN",
                    &or("DELETED_CLEANUP_INTERVAL_MIN", "60"),
                )?,
            ),
            failed_upload_retention: Duration::from_secs(
                3600 * parse_number::<u64>(
                    "FAILED_UPLOAD_RETENTION_HOURS",
                    &or("FAILED_UPLOAD_RETENTION_HOURS", "24"),
                )?,
            ),
        };

        let trusted_proxies = split_list(&var("TRUSTED_PROXY_CIDRS").unwrap_or_default())
            .iter()
            .map(|s| s.parse())
            .collect::<TroveResult<Vec<IpCidr>>>()?;

        let config = ServerConfig {
            service: ServiceConfig {
                host: or("HOST", "0.0.0.0"),
                port,
                environment,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            database,
            storage: StorageConfig {
                backend,
                max_connections,
                temp_dir,
                temp_max_age,
            },
            limits,
            authentication,
            retention,
            http: HttpConfig {
                trusted_proxies,
                cors_allowed_origins: split_list(&var("CORS_ALLOWED_ORIGINS").unwrap_or_default()),
            },
            logging: LoggingConfig {
                json: or("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> TroveResult<()> {
        if self.service.environment == Environment::Production
            && (self.authentication.session_secret.is_empty()
                || self.authentication.session_secret == DEV_SESSION_SECRET)
        {
            return Err(TroveError::Validation(
                "SESSION_SECRET must be set in production".to_string(),
            ));
        }

        if self.limits.max_upload_size == 0 {
            return Err(TroveError::Validation(
                "MAX_UPLOAD_SIZE must be greater than zero".to_string(),
            ));
        }

        if self.retention.cleanup_interval.is_zero() {
            return Err(TroveError::Validation(
                "DELETED_CLEANUP_INTERVAL_MIN must be greater than zero".to_string(),
            ));
        }

        if self.retention.deleted_retention_days < 0 {
            return Err(TroveError::Validation(
                "DELETED_RETENTION_DAYS cannot be negative".to_string(),
            ));
        }

        if let BlobBackendType::S3(s3) = &self.storage.backend {
            if s3.bucket.is_empty() {
                return Err(TroveError::Validation(
                    "S3_BUCKET is required for the s3 backend".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Connection options for the metadata store
    pub fn database_options(&self) -> DatabaseOptions {
        match &self.database {
            DatabaseConfig::Sqlite { path } => DatabaseOptions {
                max_connections: self.storage.max_connections,
                ..DatabaseOptions::sqlite(path)
            },
            DatabaseConfig::Postgres { url } => DatabaseOptions {
                url: url.clone(),
                max_connections: self.storage.max_connections,
                enable_wal: false,
            },
        }
    }

    pub fn is_production(&self) -> bool {
        self.service.environment == Environment::Production
    }

    /// Configuration for tests: in-memory database and blobs, scratch under `temp_dir`
    pub fn for_testing(temp_dir: &Path) -> Self {
        ServerConfig {
            service: ServiceConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                environment: Environment::Development,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            database: DatabaseConfig::Sqlite {
                path: PathBuf::from(":memory:"),
            },
            storage: StorageConfig {
                backend: BlobBackendType::Memory,
                max_connections: 1,
                temp_dir: temp_dir.to_path_buf(),
                temp_max_age: Duration::from_secs(3600),
            },
            limits: LimitsConfig {
                default_user_quota: 10 * GIB,
                max_upload_size: 5 * GIB,
                dedup_enabled: true,
                dedup_cross_user: false,
                dedup_hits_count_quota: true,
            },
            authentication: AuthConfig {
                session_secret: "test-secret".to_string(),
                session_duration: Duration::from_secs(3600),
                password_cost: 1,
                csrf_enabled: true,
                registration_enabled: true,
            },
            retention: RetentionConfig {
                deleted_counts_quota: true,
                deleted_retention_days: 30,
                cleanup_interval: Duration::from_secs(3600),
                failed_upload_retention: Duration::from_secs(24 * 3600),
            },
            http: HttpConfig {
                trusted_proxies: Vec::new(),
                cors_allowed_origins: Vec::new(),
            },
            logging: LoggingConfig { json: false },
        }
    }
}

/// Parse a byte size: `1024`, `512K`, `1.5G`, `10 GiB`
pub fn parse_size(raw: &str) -> TroveResult<u64> {
    let invalid = || TroveError::Validation(format!("Invalid size: {:?}", raw));

    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let upper = compact.to_ascii_uppercase();
    let split = upper
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(upper.len());
    let (number, unit) = upper.split_at(split);

    if number.is_empty() {
        return Err(invalid());
    }

    let unit = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(unit);

    let multiplier: u64 = match unit {
        "" => 1,
        "K" => KIB,
        "M" => KIB * KIB,
        "G" => GIB,
        "T" => GIB * KIB,
        _ => return Err(invalid()),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}

/// Parse a duration: `90s`, `30m`, `24h`, `7d` or bare seconds
pub fn parse_duration(raw: &str) -> TroveResult<Duration> {
    let invalid = || TroveError::Validation(format!("Invalid duration: {:?}", raw));
    let raw = raw.trim();

    let (number, unit) = match raw.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&raw[..i], c.to_ascii_lowercase()),
        _ => (raw, 's'),
    };

    let value: u64 = number.trim().parse().map_err(|_| invalid())?;
    let seconds = match unit {
        's' => Some(value),
        'm' => value.checked_mul(60),
        'h' => value.checked_mul(3600),
        'd' => value.checked_mul(86400),
        _ => None,
    }
    .ok_or_else(invalid)?;

    Ok(Duration::from_secs(seconds))
}

fn parse_bool(key: &str, raw: &str) -> TroveResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TroveError::Validation(format!("Invalid {}: {:?}", key, raw))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> TroveResult<T> {
    raw.parse()
        .map_err(|_| TroveError::Validation(format!("Invalid {}: {:?}", key, raw)))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Address block such as `10.0.0.0/8` or `::1/128`; a bare address is a /32 or /128
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    network: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(u32::from(net) as u128, u32::from(ip) as u128, self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(u128::from(net), u128::from(ip), self.prefix, 128)
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(IpAddr::V4(v4)),
                None => false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn prefix_match(net: u128, ip: u128, prefix: u8, width: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = (width - prefix) as u32;
    (net >> shift) == (ip >> shift)
}

impl std::str::FromStr for IpCidr {
    type Err = TroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TroveError::Validation(format!("Invalid CIDR: {:?}", s));
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let width = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => width,
        };
        if prefix > width {
            return Err(invalid());
        }

        Ok(IpCidr { network, prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> TroveResult<ServerConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1.5G").unwrap(), 3 * GIB / 2);
        assert_eq!(parse_size("10 GiB").unwrap(), 10 * GIB);
        assert_eq!(parse_size("2mb").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("7B").unwrap(), 7);
        assert_eq!(parse_size("1T").unwrap(), 1024 * GIB);
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("3600").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.limits.default_user_quota, 10 * GIB);
        assert_eq!(config.limits.max_upload_size, 5 * GIB);
        assert!(config.limits.dedup_enabled);
        assert!(!config.limits.dedup_cross_user);
        assert!(config.retention.deleted_counts_quota);
        assert_eq!(config.retention.deleted_retention_days, 30);
        assert_eq!(config.authentication.session_duration, Duration::from_secs(86400));
        assert!(matches!(config.storage.backend, BlobBackendType::Disk { .. }));
        assert_eq!(
            config.database_options().url,
            "sqlite://./data/trove.db?mode=rwc"
        );
    }

    #[test]
    fn test_production_requires_secret() {
        assert!(load(&[("ENV", "production")]).is_err());
        assert!(load(&[("ENV", "production"), ("SESSION_SECRET", DEV_SESSION_SECRET)]).is_err());
        assert!(load(&[("ENV", "production"), ("SESSION_SECRET", "s3cr3t-value")]).is_ok());
    }

    #[test]
    fn test_s3_requires_bucket() {
        assert!(load(&[("STORAGE_BACKEND", "s3")]).is_err());
        let config = load(&[
            ("STORAGE_BACKEND", "s3"),
            ("S3_BUCKET", "files"),
            ("S3_USE_PATH_STYLE", "true"),
        ])
        .unwrap();
        match config.storage.backend {
            BlobBackendType::S3(s3) => {
                assert_eq!(s3.bucket, "files");
                assert!(s3.use_path_style);
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_postgres_url_from_parts() {
        let config = load(&[
            ("DB_TYPE", "postgres"),
            ("DB_HOST", "db"),
            ("DB_USER", "u"),
            ("DB_PASSWORD", "p"),
            ("DB_NAME", "files"),
        ])
        .unwrap();
        assert_eq!(
            config.database_options().url,
            "postgres://u:p@db:5432/files?sslmode=disable"
        );
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        assert!(load(&[("MAX_UPLOAD_SIZE", "0")]).is_err());
        assert!(load(&[("MAX_UPLOAD_SIZE", "lots")]).is_err());
        assert!(load(&[("SESSION_DURATION", "forever")]).is_err());
        assert!(load(&[("CSRF_ENABLED", "maybe")]).is_err());
        assert!(load(&[("STORAGE_BACKEND", "tape")]).is_err());
    }

    #[test]
    fn test_cidr_matching() {
        let net: IpCidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(net.contains("::ffff:10.0.0.1".parse().unwrap()));

        let single: IpCidr = "::1".parse().unwrap();
        assert!(single.contains("::1".parse().unwrap()));
        assert!(!single.contains("::2".parse().unwrap()));

        let any: IpCidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("192.168.1.1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<IpCidr>().is_err());
        assert!("not-an-ip".parse::<IpCidr>().is_err());
    }

    #[test]
    fn test_trusted_proxies_parsed() {
        let config = load(&[("TRUSTED_PROXY_CIDRS", "127.0.0.1/32, 10.0.0.0/8")]).unwrap();
        assert_eq!(config.http.trusted_proxies.len(), 2);
        assert!(load(&[("TRUSTED_PROXY_CIDRS", "bogus")]).is_err());
    }
}
