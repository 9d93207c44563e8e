use std::sync::Arc;

use actix_files::Files;
use actix_web::{middleware, web, App, HttpServer};
use chrono::Duration;

use membership::{
    auth::TokenSigner,
    config::Config,
    db,
    payments::{PaymentProcessor, StripeClient},
    queue::QueueService,
    routes,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // initialize DB pool outside of `HttpServer::new` so that it is shared across all workers
    let pool = db::initialize_db_pool(&config.database_url).map_err(std::io::Error::other)?;
    db::run_migrations(&pool).map_err(std::io::Error::other)?;
    std::fs::create_dir_all(&config.upload_dir)?;

    let mut queue_service = QueueService::new(pool.clone(), config.amqp.clone());
    match queue_service.initialize().await {
        Ok(()) => {
            let consumer = queue_service.clone();
            tokio::spawn(async move {
                if let Err(e) = consumer.start_consuming_expired_offers().await {
                    log::error!("Error starting expired offer consumer: {:?}", e);
                }
            });
        }
        Err(e) => log::warn!("RabbitMQ unavailable, notifications are disabled: {:?}", e),
    }
    let queue_service = web::Data::new(queue_service);

    let processor: Arc<dyn PaymentProcessor> = Arc::new(StripeClient::new(&config.payments));
    let processor = web::Data::from(processor);
    let signer = web::Data::new(TokenSigner::new(
        &config.jwt_secret,
        Duration::hours(config.token_ttl_hours),
    ));
    if config.payments.secret_key.is_none() {
        log::warn!("PAYMENT_SECRET_KEY is not set, payment endpoints will answer 503");
    }

    let bind_addr = config.bind_addr.clone();
    let upload_dir = config.upload_dir.clone();
    let config = web::Data::new(config);

    log::info!("starting HTTP server at http://{}", bind_addr);

    HttpServer::new(move || {
        App::new()
            // add DB pool handle to app data; enables use of `web::Data<DbPool>` extractor
            .app_data(web::Data::new(pool.clone()))
            .app_data(config.clone())
            .app_data(signer.clone())
            .app_data(processor.clone())
            .app_data(queue_service.clone())
            .wrap(middleware::Logger::default())
            .service(Files::new("/uploads", upload_dir.clone()))
            .configure(routes::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
