use actix_web::{App, HttpServer, middleware::Logger, web};
use chrono::Local; // timestamp in log lines
use env_logger::{Env, Target};
use std::io::Write; // for env_logger custom formatter
use std::sync::Arc;

use realty_billing::{
    config::Config,
    database::{
        EventStore, SeaOrmEventStore, SeaOrmSubscriptionStore, SubscriptionStore, create_pool,
        run_migrations,
    },
    external::{PaymentGateway, StripeGateway},
    handlers,
    middlewares::{AuthMiddleware, create_cors},
    services::*,
    swagger::swagger_config,
    tasks,
    utils::{Clock, JwtService, SystemClock},
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
            let level = record.level().as_str().to_ascii_lowercase();
            let msg_json = serde_json::to_string(&format!("{}", record.args()))
                .unwrap_or_else(|_| "\"<invalid utf8>\"".to_string());
            writeln!(
                buf,
                "{{\"timestamp\":\"{}\",\"level\":\"{}\",\"message\":{},\"target\":\"{}\"}}",
                ts,
                level,
                msg_json,
                record.target(),
            )
        })
        .target(Target::Stdout)
        .init();

    // 加载配置
    let config = Config::from_toml().expect("Failed to load configuration file");

    // 创建数据库连接池
    let pool = create_pool(&config.database)
        .await
        .expect("Failed to create database connection pool");

    // 运行数据库迁移
    run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    let jwt_service = JwtService::new(&config.jwt.secret);

    // 存储、时钟与支付网关
    let subscription_store: Arc<dyn SubscriptionStore> =
        Arc::new(SeaOrmSubscriptionStore::new(pool.clone()));
    let event_store: Arc<dyn EventStore> = Arc::new(SeaOrmEventStore::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(config.stripe.clone()));
    if !gateway.is_enabled() {
        log::warn!("Stripe credentials are not configured; checkout and reconciliation fetches are disabled");
    }

    // 创建服务
    let billing = config.billing.clone();
    let subscription_service = SubscriptionService::new(
        subscription_store.clone(),
        clock.clone(),
        billing.max_write_attempts,
    );
    let webhook_service = WebhookService::new(
        event_store.clone(),
        subscription_service.clone(),
        gateway.clone(),
        config.stripe.clone(),
        billing.pending_reclaim_after(),
    );
    let reconciliation_service = ReconciliationService::new(
        subscription_service.clone(),
        event_store,
        gateway.clone(),
        billing.clone(),
    );
    let entitlement_service =
        EntitlementService::new(subscription_store, clock, billing.grace_period());
    let checkout_service = CheckoutService::new(subscription_service.clone(), gateway);

    // 启动后台对账任务
    tasks::spawn_all(reconciliation_service, billing.reconcile_interval());

    // 启动HTTP服务器
    log::info!(
        "Starting HTTP server at {}:{}",
        config.server.host,
        config.server.port
    );

    let cors_origins = config.server.cors_origins.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(create_cors(&cors_origins))
            .wrap(AuthMiddleware::new(jwt_service.clone()))
            .app_data(web::Data::new(subscription_service.clone()))
            .app_data(web::Data::new(webhook_service.clone()))
            .app_data(web::Data::new(entitlement_service.clone()))
            .app_data(web::Data::new(checkout_service.clone()))
            .configure(swagger_config)
            .configure(handlers::webhook_config)
            .service(web::scope("/api/v1").configure(handlers::billing_config))
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}
