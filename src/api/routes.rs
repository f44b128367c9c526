// Route table

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/admin").service(
                web::resource("/shopify/migrations")
                    .route(web::post().to(handlers::trigger_migrations))
                    .route(web::get().to(handlers::list_migrations)),
            ),
        );
}
