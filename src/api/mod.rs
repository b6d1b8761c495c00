//! API endpoints for the DOTS server.
//!
//! This module maps the mitigation request operations onto HTTP. The
//! authenticating front end sets the `X-Dots-Customer-Id` header; an
//! `If-Match` header on PUT selects the efficacy-update path.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::scope::{
    ConflictInformation, CustomerId, MitigationRequest, MitigationStatusSnapshot, ScopeInput,
};
use crate::core::{MitigationEngine, MitigationError, PutOutcome};

/// Header carrying the authenticated customer id
pub const CUSTOMER_HEADER: &str = "X-Dots-Customer-Id";

pub struct ApiState {
    pub engine: Arc<MitigationEngine>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(
                web::resource("/mitigate/cuid/{cuid}")
                    .route(web::put().to(create_mitigations))
                    .route(web::get().to(get_mitigations)),
            )
            .service(
                web::resource("/mitigate/cuid/{cuid}/mid/{mid}")
                    .route(web::put().to(put_mitigation))
                    .route(web::get().to(get_mitigation))
                    .route(web::delete().to(delete_mitigation)),
            ),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Mitigation request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitigationBody {
    #[serde(rename = "mitigation-scope")]
    pub mitigation_scope: MitigationScopeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MitigationScopeBody {
    #[serde(default)]
    pub client_domain_identifier: Option<String>,
    pub scope: Vec<ScopeInput>,
}

/// Status response body
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    #[serde(rename = "mitigation-scope")]
    pub mitigation_scope: StatusScopeBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusScopeBody {
    pub scope: Vec<MitigationStatusSnapshot>,
}

/// Conflict response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictBody {
    #[serde(rename = "conflict-information")]
    pub conflict_information: ConflictInformation,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: &MitigationError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        MitigationError::Validation(_) | MitigationError::AliasNotFound(_) => {
            warn!("Rejected request: {}", err);
            HttpResponse::BadRequest().json(body)
        }
        MitigationError::Blocker(_)
        | MitigationError::Persistence(_)
        | MitigationError::Construction(_) => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: message.to_string(),
    })
}

fn conflict_response(conflict: ConflictInformation) -> HttpResponse {
    HttpResponse::Conflict().json(ConflictBody {
        conflict_information: conflict,
    })
}

fn customer_id(req: &HttpRequest) -> Result<CustomerId, HttpResponse> {
    req.headers()
        .get(CUSTOMER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<CustomerId>().ok())
        .ok_or_else(|| {
            HttpResponse::Unauthorized().json(ErrorResponse {
                error: format!("missing or invalid {} header", CUSTOMER_HEADER),
            })
        })
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create every scope of the body as one batch
async fn create_mitigations(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<MitigationBody>,
) -> HttpResponse {
    let customer_id = match customer_id(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let body = body.into_inner().mitigation_scope;
    let request = MitigationRequest {
        client_identifier: path.into_inner(),
        client_domain_identifier: body.client_domain_identifier,
        scopes: body.scope,
    };

    match state.engine.create(customer_id, &request).await {
        Ok(None) => HttpResponse::Created().finish(),
        Ok(Some(conflict)) => conflict_response(conflict),
        Err(e) => error_response(&e),
    }
}

/// Create, update or efficacy-update one mitigation
async fn put_mitigation(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
    body: web::Json<MitigationBody>,
) -> HttpResponse {
    let customer_id = match customer_id(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let (cuid, mid) = path.into_inner();
    let body = body.into_inner().mitigation_scope;
    if body.scope.len() != 1 {
        return bad_request("exactly one scope is expected");
    }
    let mut input = body.scope[0].clone();
    if input.mitigation_id == 0 {
        input.mitigation_id = mid;
    } else if input.mitigation_id != mid {
        return bad_request("mitigation id in body does not match the path");
    }
    let if_match = req.headers().get("If-Match").map(|value| value.as_bytes().to_vec());

    match state
        .engine
        .put(
            customer_id,
            &cuid,
            body.client_domain_identifier,
            &input,
            if_match.as_deref(),
        )
        .await
    {
        Ok(PutOutcome::Created) => HttpResponse::Created().finish(),
        Ok(PutOutcome::Changed) => HttpResponse::Ok().finish(),
        Ok(PutOutcome::Conflict(conflict)) => conflict_response(conflict),
        Err(e) => error_response(&e),
    }
}

async fn get_mitigations(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let customer_id = match customer_id(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.get(customer_id, &path.into_inner(), None).await {
        Ok(scope) if scope.is_empty() => HttpResponse::NotFound().finish(),
        Ok(scope) => HttpResponse::Ok().json(StatusBody {
            mitigation_scope: StatusScopeBody { scope },
        }),
        Err(e) => error_response(&e),
    }
}

async fn get_mitigation(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    let customer_id = match customer_id(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let (cuid, mid) = path.into_inner();
    match state.engine.get(customer_id, &cuid, Some(mid)).await {
        Ok(scope) if scope.is_empty() => HttpResponse::NotFound().finish(),
        Ok(scope) => HttpResponse::Ok().json(StatusBody {
            mitigation_scope: StatusScopeBody { scope },
        }),
        Err(e) => error_response(&e),
    }
}

async fn delete_mitigation(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    let customer_id = match customer_id(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let (cuid, mid) = path.into_inner();
    match state.engine.delete(customer_id, &cuid, mid).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blocker::{Blocker, LogBlocker};
    use crate::core::scope::ConflictCause;
    use crate::core::{
        InMemoryAliasStore, InMemoryProtectionStore, InMemoryScopeStore, LowestLoadSelection, SelectionService,
    };
    use crate::models::{BlockerConfig, LifetimeConfig};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::json;
    use std::collections::HashMap;

    fn state() -> web::Data<ApiState> {
        let blocker = LogBlocker::new(&BlockerConfig {
            id: "log-0".to_string(),
            kind: "log".to_string(),
            capacity: 16,
            params: HashMap::new(),
        });
        let selection = SelectionService::start(
            vec![Arc::new(blocker) as Arc<dyn Blocker>],
            Arc::new(LowestLoadSelection),
            8,
        );
        let engine = MitigationEngine::builder()
            .store(Arc::new(InMemoryScopeStore::new()))
            .protection_store(Arc::new(InMemoryProtectionStore::new()))
            .alias_store(Arc::new(InMemoryAliasStore::new()))
            .selection(Arc::new(selection))
            .lifetime(LifetimeConfig::default())
            .build()
            .unwrap();
        web::Data::new(ApiState { engine })
    }

    fn body(prefix: &str) -> serde_json::Value {
        json!({
            "mitigation-scope": {
                "scope": [{
                    "target-prefix": [prefix],
                    "target-protocol": [17],
                    "lifetime": 3600
                }]
            }
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().configure(config)).await;

        let req = test::TestRequest::get().uri("/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_mitigation_lifecycle() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::put()
            .uri("/v1/mitigate/cuid/client-1/mid/12")
            .insert_header((CUSTOMER_HEADER, "1"))
            .set_json(body("192.0.2.0/24"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::get()
            .uri("/v1/mitigate/cuid/client-1/mid/12")
            .insert_header((CUSTOMER_HEADER, "1"))
            .to_request();
        let status: StatusBody = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status.mitigation_scope.scope.len(), 1);
        assert_eq!(status.mitigation_scope.scope[0].mitigation_id, 12);
        assert_eq!(status.mitigation_scope.scope[0].status_code, 2);

        let req = test::TestRequest::delete()
            .uri("/v1/mitigate/cuid/client-1/mid/12")
            .insert_header((CUSTOMER_HEADER, "1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get()
            .uri("/v1/mitigate/cuid/client-1/mid/12")
            .insert_header((CUSTOMER_HEADER, "1"))
            .to_request();
        let status: StatusBody = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status.mitigation_scope.scope[0].status_code, 5);
    }

    #[actix_web::test]
    async fn test_third_party_overlap_returns_conflict() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::put()
            .uri("/v1/mitigate/cuid/client-1/mid/1")
            .insert_header((CUSTOMER_HEADER, "1"))
            .set_json(body("192.0.2.0/24"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::put()
            .uri("/v1/mitigate/cuid/client-2/mid/1")
            .insert_header((CUSTOMER_HEADER, "2"))
            .set_json(body("192.0.2.128/25"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let conflict: ConflictBody = test::read_body_json(resp).await;
        assert_eq!(
            conflict.conflict_information.conflict_cause,
            ConflictCause::OverlappingTargets
        );
        assert_eq!(conflict.conflict_information.retry_timer, Some(120));
    }

    #[actix_web::test]
    async fn test_request_validation() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::put()
            .uri("/v1/mitigate/cuid/client-1/mid/1")
            .set_json(body("192.0.2.0/24"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::put()
            .uri("/v1/mitigate/cuid/client-1/mid/1")
            .insert_header((CUSTOMER_HEADER, "1"))
            .set_json(body("127.0.0.1/32"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/v1/mitigate/cuid/client-1/mid/404")
            .insert_header((CUSTOMER_HEADER, "1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_batch_create() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::put()
            .uri("/v1/mitigate/cuid/client-1")
            .insert_header((CUSTOMER_HEADER, "1"))
            .set_json(json!({
                "mitigation-scope": {
                    "scope": [
                        { "mitigation-id": 1, "target-prefix": ["192.0.2.0/24"], "lifetime": 60 },
                        { "mitigation-id": 2, "target-fqdn": ["www.example.com"], "lifetime": 60 }
                    ]
                }
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::get()
            .uri("/v1/mitigate/cuid/client-1")
            .insert_header((CUSTOMER_HEADER, "1"))
            .to_request();
        let status: StatusBody = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status.mitigation_scope.scope.len(), 2);
    }
}
