use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::entities::PlanTier;
use crate::external::BillingCycle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 允许的前端来源，为空时不限制
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_success_url")]
    pub success_url: String,
    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub trial_period_days: Option<u32>,
    #[serde(default)]
    pub standard_monthly_price_id: Option<String>,
    #[serde(default)]
    pub standard_yearly_price_id: Option<String>,
    #[serde(default)]
    pub premium_monthly_price_id: Option<String>,
    #[serde(default)]
    pub premium_yearly_price_id: Option<String>,
    #[serde(default)]
    pub agency_monthly_price_id: Option<String>,
    #[serde(default)]
    pub agency_yearly_price_id: Option<String>,
}

fn default_success_url() -> String {
    "http://localhost:3000/billing/success".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/billing/cancel".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
            request_timeout_secs: default_request_timeout_secs(),
            trial_period_days: None,
            standard_monthly_price_id: None,
            standard_yearly_price_id: None,
            premium_monthly_price_id: None,
            premium_yearly_price_id: None,
            agency_monthly_price_id: None,
            agency_yearly_price_id: None,
        }
    }
}

impl StripeConfig {
    /// 是否配置了 Stripe 密钥；未配置时所有对 Stripe 的调用都被禁用
    pub fn has_credentials(&self) -> bool {
        !self.secret_key.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn price_id(&self, tier: PlanTier, cycle: BillingCycle) -> Option<&str> {
        let id = match (tier, cycle) {
            (PlanTier::Free, _) => None,
            (PlanTier::Standard, BillingCycle::Monthly) => self.standard_monthly_price_id.as_ref(),
            (PlanTier::Standard, BillingCycle::Yearly) => self.standard_yearly_price_id.as_ref(),
            (PlanTier::Premium, BillingCycle::Monthly) => self.premium_monthly_price_id.as_ref(),
            (PlanTier::Premium, BillingCycle::Yearly) => self.premium_yearly_price_id.as_ref(),
            (PlanTier::Agency, BillingCycle::Monthly) => self.agency_monthly_price_id.as_ref(),
            (PlanTier::Agency, BillingCycle::Yearly) => self.agency_yearly_price_id.as_ref(),
        };
        id.map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    /// 订阅 metadata 没有 tier 时按价格 id 反查
    pub fn tier_for_price(&self, price_id: &str) -> Option<PlanTier> {
        [PlanTier::Standard, PlanTier::Premium, PlanTier::Agency]
            .into_iter()
            .find(|tier| {
                [BillingCycle::Monthly, BillingCycle::Yearly]
                    .into_iter()
                    .any(|cycle| self.price_id(*tier, cycle) == Some(price_id))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// past_due 状态下仍保留访问权限的宽限期
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i64,
    /// 条件写冲突时的最大尝试次数
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    #[serde(default = "default_failed_event_lookback_hours")]
    pub failed_event_lookback_hours: i64,
    #[serde(default = "default_pending_reclaim_after_secs")]
    pub pending_reclaim_after_secs: i64,
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: u64,
}

fn default_grace_period_days() -> i64 {
    3
}

fn default_max_write_attempts() -> u32 {
    5
}

fn default_reconcile_interval_secs() -> u64 {
    15 * 60
}

fn default_stale_after_secs() -> i64 {
    3600
}

fn default_failed_event_lookback_hours() -> i64 {
    7 * 24
}

fn default_pending_reclaim_after_secs() -> i64 {
    15 * 60
}

fn default_reconcile_batch_size() -> u64 {
    500
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: default_grace_period_days(),
            max_write_attempts: default_max_write_attempts(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            failed_event_lookback_hours: default_failed_event_lookback_hours(),
            pending_reclaim_after_secs: default_pending_reclaim_after_secs(),
            reconcile_batch_size: default_reconcile_batch_size(),
        }
    }
}

impl BillingConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.grace_period_days.max(0))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs.max(0))
    }

    pub fn failed_event_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.failed_event_lookback_hours.max(0))
    }

    pub fn pending_reclaim_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_reclaim_after_secs.max(0))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

impl Config {
    pub fn from_toml() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        use std::io::ErrorKind;

        // 尝试读取配置文件，如果不存在则完全依赖环境变量
        let config_result = std::fs::read_to_string(&config_path);

        let mut config: Config = match config_result {
            Ok(config_str) => {
                toml::from_str(&config_str).map_err(|e| format!("解析配置文件失败: {e}"))?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fn get_env(name: &str) -> Option<String> {
                    env::var(name).ok()
                }
                fn get_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
                    env::var(name)
                        .ok()
                        .and_then(|v| v.parse::<T>().ok())
                        .unwrap_or(default)
                }

                // 数据库 URL 在无配置文件时必须提供
                let database_url = get_env("DATABASE_URL")
                    .ok_or("缺少 DATABASE_URL 环境变量，且未找到配置文件 config.toml")?;

                Config {
                    server: ServerConfig {
                        host: get_env("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                        port: get_env_parse("SERVER_PORT", 8080u16),
                        cors_origins: Vec::new(),
                    },
                    database: DatabaseConfig {
                        url: database_url,
                        max_connections: get_env_parse("DB_MAX_CONNECTIONS", 10u32),
                    },
                    jwt: JwtConfig {
                        secret: get_env("JWT_SECRET")
                            .unwrap_or_else(|| "change-me-in-production".to_string()),
                    },
                    stripe: StripeConfig::default(),
                    billing: BillingConfig::default(),
                }
            }
            Err(e) => {
                return Err(format!("无法读取配置文件 {config_path}: {e}").into());
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    // 环境变量覆盖（即便文件存在时也覆盖）
    fn apply_env_overrides(&mut self) {
        fn set_string(target: &mut String, name: &str) {
            if let Ok(v) = env::var(name) {
                *target = v;
            }
        }
        fn set_optional(target: &mut Option<String>, name: &str) {
            if let Ok(v) = env::var(name) {
                *target = Some(v);
            }
        }
        fn set_parsed<T: std::str::FromStr>(target: &mut T, name: &str) {
            if let Ok(v) = env::var(name)
                && let Ok(parsed) = v.parse()
            {
                *target = parsed;
            }
        }

        set_string(&mut self.server.host, "SERVER_HOST");
        set_parsed(&mut self.server.port, "SERVER_PORT");
        if let Ok(v) = env::var("CORS_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_owned)
                .collect();
        }
        set_string(&mut self.database.url, "DATABASE_URL");
        set_parsed(&mut self.database.max_connections, "DB_MAX_CONNECTIONS");
        set_string(&mut self.jwt.secret, "JWT_SECRET");

        set_string(&mut self.stripe.secret_key, "STRIPE_SECRET_KEY");
        set_string(&mut self.stripe.webhook_secret, "STRIPE_WEBHOOK_SECRET");
        set_string(&mut self.stripe.success_url, "STRIPE_SUCCESS_URL");
        set_string(&mut self.stripe.cancel_url, "STRIPE_CANCEL_URL");
        set_parsed(
            &mut self.stripe.request_timeout_secs,
            "STRIPE_REQUEST_TIMEOUT_SECS",
        );
        if let Ok(v) = env::var("STRIPE_TRIAL_PERIOD_DAYS")
            && let Ok(days) = v.parse()
        {
            self.stripe.trial_period_days = Some(days);
        }
        set_optional(
            &mut self.stripe.standard_monthly_price_id,
            "STRIPE_STANDARD_MONTHLY_PRICE_ID",
        );
        set_optional(
            &mut self.stripe.standard_yearly_price_id,
            "STRIPE_STANDARD_YEARLY_PRICE_ID",
        );
        set_optional(
            &mut self.stripe.premium_monthly_price_id,
            "STRIPE_PREMIUM_MONTHLY_PRICE_ID",
        );
        set_optional(
            &mut self.stripe.premium_yearly_price_id,
            "STRIPE_PREMIUM_YEARLY_PRICE_ID",
        );
        set_optional(
            &mut self.stripe.agency_monthly_price_id,
            "STRIPE_AGENCY_MONTHLY_PRICE_ID",
        );
        set_optional(
            &mut self.stripe.agency_yearly_price_id,
            "STRIPE_AGENCY_YEARLY_PRICE_ID",
        );

        set_parsed(&mut self.billing.grace_period_days, "BILLING_GRACE_PERIOD_DAYS");
        set_parsed(
            &mut self.billing.max_write_attempts,
            "BILLING_MAX_WRITE_ATTEMPTS",
        );
        set_parsed(
            &mut self.billing.reconcile_interval_secs,
            "BILLING_RECONCILE_INTERVAL_SECS",
        );
        set_parsed(&mut self.billing.stale_after_secs, "BILLING_STALE_AFTER_SECS");
        set_parsed(
            &mut self.billing.failed_event_lookback_hours,
            "BILLING_FAILED_EVENT_LOOKBACK_HOURS",
        );
        set_parsed(
            &mut self.billing.pending_reclaim_after_secs,
            "BILLING_PENDING_RECLAIM_AFTER_SECS",
        );
        set_parsed(
            &mut self.billing.reconcile_batch_size,
            "BILLING_RECONCILE_BATCH_SIZE",
        );
    }
}
