// API server built on actix-web

use crate::api::{auth, handlers::AppState, middleware, routes};
use crate::util::env::{env_opt, env_parse, env_req, init_env};
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub api_secret: String,
    pub allowed_origins: String,
}

impl ApiServer {
    pub fn from_env() -> Result<Self> {
        init_env();
        let host = env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_parse("API_PORT", 8080u16);
        let api_secret = env_req("API_SECRET").context("API_SECRET is required")?;
        let allowed_origins = env_opt("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://localhost:8000".to_string());

        Ok(Self {
            host,
            port,
            api_secret,
            allowed_origins,
        })
    }

    pub async fn run(self, state: AppState) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);
        tracing::info!(host = %self.host, port = self.port, "starting sync API server");

        let state = web::Data::new(state);
        let api_secret = self.api_secret.clone();
        let allowed_origins = self.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);
            let auth = auth::Auth::new(api_secret.clone());

            App::new()
                .app_data(state.clone())
                .wrap(auth)
                .wrap(cors)
                .wrap(compress)
                .wrap(logger)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("failed to bind to {bind_addr}"))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
