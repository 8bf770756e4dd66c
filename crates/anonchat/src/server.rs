//! Actix Web HTTP server.
//!
//! Exposes one OpenAI-compatible endpoint:
//! - `POST /v1/chat/completions`
//!
//! Everything else is a JSON 404, except `OPTIONS` which always answers 200
//! so browser preflights succeed.

use std::convert::Infallible;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::http::header::CACHE_CONTROL;
use actix_web::http::Method;
use actix_web::{middleware, web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::refresher::{RefreshLoop, RefreshPolicy, SessionRefresher};
use crate::responder::{CompletionReply, CompletionResponder};
use crate::session::SessionState;
use crate::types::{ChatCompletionRequest, InvalidRequestEnvelope};
use crate::upstream::UpstreamClient;

const PROXY_ENV_VARS: [&str; 4] = ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

/// Shared session state and the components working on it.
pub struct ProxyServices {
    pub state: Arc<SessionState>,
    pub refresher: Arc<SessionRefresher>,
    pub responder: Arc<CompletionResponder>,
}

impl ProxyServices {
    pub fn new(config: &ProxyConfig) -> crate::error::Result<Self> {
        let upstream = UpstreamClient::new(config)?;
        let state = Arc::new(SessionState::new());
        let refresher = Arc::new(SessionRefresher::new(
            upstream.clone(),
            state.clone(),
            config.proof_of_work,
        ));
        let responder = Arc::new(CompletionResponder::new(
            config,
            upstream,
            refresher.clone(),
        ));
        Ok(Self {
            state,
            refresher,
            responder,
        })
    }

    pub fn refresh_loop(&self, config: &ProxyConfig) -> RefreshLoop {
        RefreshLoop::new(self.refresher.clone(), RefreshPolicy::from_config(config))
    }
}

#[derive(Clone)]
pub struct AppState {
    /// Reported back in the 404 hint.
    pub port: u16,
    pub responder: Arc<CompletionResponder>,
}

/// Build the application. Used by [`serve`] for every worker and by tests.
pub fn app(
    state: web::Data<AppState>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(state)
        .app_data(web::JsonConfig::default().error_handler(json_error))
        .wrap(
            Cors::default()
                .allow_any_origin()
                .send_wildcard()
                .allow_any_header()
                .allowed_methods(["GET", "POST", "OPTIONS"])
                .disable_preflight(),
        )
        .wrap(
            middleware::DefaultHeaders::new()
                .add(("Access-Control-Allow-Origin", "*"))
                .add(("Access-Control-Allow-Headers", "*"))
                .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS")),
        )
        .service(
            web::resource("/v1/chat/completions")
                .route(web::post().to(chat_completions))
                .default_service(web::to(fallback)),
        )
        .default_service(web::to(fallback))
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    if config.proxy.is_some() {
        // The explicit proxy must be the only one in play.
        for key in PROXY_ENV_VARS {
            std::env::remove_var(key);
        }
    }

    let services = ProxyServices::new(&config).context("failed to build upstream client")?;

    let _refresh = if config.background_refresh {
        Some(services.refresh_loop(&config).spawn())
    } else {
        warn!("background token refresh disabled");
        None
    };

    let addr = format!("0.0.0.0:{}", config.port);
    info!(
        addr = %addr,
        base_url = %config.base_url_trimmed(),
        proxy = config.proxy.as_deref().unwrap_or("none"),
        "anonchat listening"
    );

    let state = web::Data::new(AppState {
        port: config.port,
        responder: services.responder.clone(),
    });

    HttpServer::new(move || app(state.clone()))
        .bind(&addr)
        .with_context(|| format!("failed to bind {}", addr))?
        .run()
        .await
        .context("server error")?;

    Ok(())
}

async fn chat_completions(
    state: web::Data<AppState>,
    body: web::Json<ChatCompletionRequest>,
) -> HttpResponse {
    match state.responder.respond(body.into_inner()).await {
        CompletionReply::Stream(frames) => HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header((CACHE_CONTROL, "no-cache"))
            .streaming(frames.map(Ok::<_, Infallible>)),
        CompletionReply::Complete(completion) => HttpResponse::Ok().json(completion),
        // The envelope goes out with 200, like a failure after the headers
        // were already sent.
        CompletionReply::Failed(envelope) => HttpResponse::Ok().json(envelope),
    }
}

async fn fallback(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return HttpResponse::Ok().finish();
    }
    HttpResponse::NotFound().json(InvalidRequestEnvelope::new(not_found_message(state.port)))
}

pub fn not_found_message(port: u16) -> String {
    format!(
        "The requested endpoint was not found. please make sure to use \"http://localhost:{}/v1\" as the base URL.",
        port
    )
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(InvalidRequestEnvelope::new(err.to_string()));
    InternalError::from_response(err, response).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_mentions_port() {
        let message = not_found_message(3040);
        assert!(message.contains("http://localhost:3040/v1"));
        assert!(message.starts_with("The requested endpoint was not found."));
    }

    #[test]
    fn test_services_share_one_session() {
        let services = ProxyServices::new(&ProxyConfig::builtin()).unwrap();
        assert!(Arc::ptr_eq(&services.state, services.refresher.state()));
    }
}
