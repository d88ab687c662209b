use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use routewise_core::config::AppConfig;
use routewise_core::domain::instance::{Decision, InstanceStepId, WorkflowInstance};
use routewise_core::domain::org::PickerMode;
use routewise_core::domain::principal::PrincipalId;
use routewise_core::domain::request::RequestId;
use routewise_core::domain::template::TemplateId;
use routewise_core::errors::{ApplicationError, InterfaceError};
use routewise_core::org::PickerNode;
use routewise_core::workflow::{EngineOutcome, RequestUpdate};
use routewise_db::{
    DbPool, RepositoryError, SqlOrgRepository, SqlWorkflowRepository, WorkflowRepository,
};

use crate::health::health;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    pub db_pool: DbPool,
    workflow: Arc<SqlWorkflowRepository>,
    org: Arc<SqlOrgRepository>,
}

impl ApiState {
    pub fn new(db_pool: DbPool, config: &AppConfig) -> Self {
        let workflow = SqlWorkflowRepository::new(
            db_pool.clone(),
            config.workflow.engine(),
            config.workflow.delegation_resolver(),
        );
        let org = SqlOrgRepository::new(db_pool.clone());
        Self { db_pool, workflow: Arc::new(workflow), org: Arc::new(org) }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/org-nodes/picker", get(org_picker))
        .route("/org-nodes/chart", get(org_chart))
        .route("/requests/{request_id}/instance", get(show_instance).post(start_instance))
        .route("/steps/{step_id}/decision", post(record_decision))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

/// Wire form of [`InterfaceError`].
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn from_repository(error: RepositoryError, correlation_id: &str) -> Self {
        Self(ApplicationError::from(error).into_interface(correlation_id))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(
            event_name = "api.request.failed",
            correlation_id = self.0.correlation_id(),
            status = status.as_u16(),
            error = self.0.message(),
            "api request failed"
        );
        let body = ErrorBody {
            error: self.0.user_message().to_string(),
            message: self.0.message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[derive(Debug, Deserialize)]
pub struct PickerQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

pub async fn org_picker(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<PickerQuery>,
) -> Result<Json<Vec<PickerNode>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let raw = query.mode.unwrap_or_default();
    let mode = PickerMode::parse(&raw).ok_or_else(|| {
        ApiError::bad_request(format!("unknown picker mode `{raw}`"), &correlation_id)
    })?;

    let nodes = state
        .org
        .picker(mode)
        .await
        .map_err(|error| ApiError::from_repository(error, &correlation_id))?;
    Ok(Json(nodes))
}

/// Chart tree: nodes of hidden types are lifted out of the hierarchy.
pub async fn org_chart(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PickerNode>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let nodes = state
        .org
        .chart()
        .await
        .map_err(|error| ApiError::from_repository(error, &correlation_id))?;
    Ok(Json(nodes))
}

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub instance: WorkflowInstance,
    pub request: Option<RequestUpdate>,
}

impl From<EngineOutcome> for InstanceResponse {
    fn from(outcome: EngineOutcome) -> Self {
        Self { instance: outcome.instance, request: outcome.request }
    }
}

pub async fn show_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let request_id = RequestId(request_id);
    state
        .workflow
        .find_instance_for_request(&request_id)
        .await
        .map_err(|error| ApiError::from_repository(error, &correlation_id))?
        .map(Json)
        .ok_or_else(|| {
            ApiError::from_repository(
                RepositoryError::NotFound { entity: "instance", id: request_id.0.clone() },
                &correlation_id,
            )
        })
}

#[derive(Debug, Deserialize)]
pub struct StartInstanceBody {
    pub template_id: String,
    pub actor_id: String,
}

pub async fn start_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
    Json(body): Json<StartInstanceBody>,
) -> Result<(StatusCode, Json<InstanceResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let request_id = RequestId(request_id);

    let outcome = state
        .workflow
        .start_instance(
            &request_id,
            &TemplateId(body.template_id.trim().to_string()),
            &PrincipalId::new(body.actor_id.trim()),
            Utc::now(),
            &correlation_id,
        )
        .await
        .map_err(|error| ApiError::from_repository(error, &correlation_id))?;

    info!(
        event_name = "api.instance.started",
        correlation_id = %correlation_id,
        request_id = %request_id,
        instance_id = %outcome.instance.id,
        "workflow instance started via api"
    );
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub decision: String,
    pub actor_id: String,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn record_decision(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(step_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let decision = Decision::parse(&body.decision).ok_or_else(|| {
        ApiError::bad_request(format!("unknown decision `{}`", body.decision), &correlation_id)
    })?;
    let note = body.note.map(|note| note.trim().to_string()).filter(|note| !note.is_empty());

    let outcome = state
        .workflow
        .record_decision(
            &InstanceStepId(step_id),
            decision,
            &PrincipalId::new(body.actor_id.trim()),
            note,
            Utc::now(),
            &correlation_id,
        )
        .await
        .map_err(|error| ApiError::from_repository(error, &correlation_id))?;

    Ok(Json(outcome.into()))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, Request, StatusCode},
        Json,
    };
    use chrono::Utc;
    use tower::ServiceExt;

    use routewise_core::config::AppConfig;
    use routewise_core::domain::instance::Decision;
    use routewise_core::domain::org::{DisplayNames, LegacyKey, LegacyKind, LegacyOrgEntity};
    use routewise_core::domain::principal::{OrgPlacement, Principal, PrincipalId};
    use routewise_core::domain::request::{RequestId, RequestStatus, WorkflowRequest};
    use routewise_core::domain::template::{
        ApproverSpec, ExecutionMode, StepTemplate, StepTemplateId, TemplateId, WorkflowTemplate,
    };
    use routewise_db::{
        connect_with_settings, migrations, DbPool, SqlDirectoryRepository, SqlOrgRepository,
        SqlTemplateRepository,
    };

    use super::{
        org_chart, org_picker, record_decision, router, start_instance, ApiState, DecisionBody,
        PickerQuery, StartInstanceBody, CORRELATION_HEADER,
    };

    async fn seeded() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");

        let directory = SqlDirectoryRepository::new(pool.clone());
        for (id, role) in [("requester", "staff"), ("manager", "manager"), ("root", "ADMIN")] {
            directory
                .upsert_principal(&Principal {
                    id: PrincipalId::new(id),
                    display_name: id.to_string(),
                    email: None,
                    role: role.to_string(),
                    active: true,
                    placement: OrgPlacement::default(),
                })
                .await
                .expect("principal");
        }

        let template = WorkflowTemplate {
            id: TemplateId("tpl-leave".to_string()),
            name: "Leave request".to_string(),
            sla_days_default: Some(2),
            active: true,
            steps: vec![StepTemplate {
                id: StepTemplateId("st-1".to_string()),
                step_order: 1,
                mode: ExecutionMode::Sequential,
                approver: ApproverSpec::user("manager").to_fields(),
                sla_days: None,
                co_assignees: Vec::new(),
            }],
        };
        SqlTemplateRepository::new(pool.clone())
            .save(&template, &PrincipalId::new("root"), Utc::now(), "seed")
            .await
            .expect("template");

        let state = ApiState::new(pool.clone(), &AppConfig::default());
        state
            .workflow
            .create_request(&WorkflowRequest {
                id: RequestId("req-9".to_string()),
                requester_id: PrincipalId::new("requester"),
                title: "Annual leave".to_string(),
                status: RequestStatus::Pending,
                current_role: None,
                is_escalated: false,
                escalated_at: None,
                created_at: Utc::now(),
                current_step_started_at: None,
            })
            .await
            .expect("request");
        pool
    }

    fn headers(correlation_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_str(correlation_id).expect("header"));
        headers
    }

    fn start_body() -> Json<StartInstanceBody> {
        Json(StartInstanceBody {
            template_id: "tpl-leave".to_string(),
            actor_id: "requester".to_string(),
        })
    }

    #[tokio::test]
    async fn start_then_approve_completes_single_step_instance() {
        let state = ApiState::new(seeded().await, &AppConfig::default());

        let (status, Json(started)) = start_instance(
            State(state.clone()),
            headers("corr-start"),
            Path("req-9".to_string()),
            start_body(),
        )
        .await
        .expect("start");
        assert_eq!(status, StatusCode::CREATED);
        let step_id = started.instance.current_step().expect("step").id.0.clone();

        let Json(decided) = record_decision(
            State(state),
            headers("corr-decide"),
            Path(step_id),
            Json(DecisionBody {
                decision: "approve".to_string(),
                actor_id: "manager".to_string(),
                note: Some("  enjoy  ".to_string()),
            }),
        )
        .await
        .expect("decision");

        assert!(decided.instance.completed);
        assert_eq!(decided.instance.outcome, Some(Decision::Approved));
        assert_eq!(decided.request.expect("request update").status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn starting_twice_maps_to_conflict_with_caller_correlation_id() {
        let state = ApiState::new(seeded().await, &AppConfig::default());
        start_instance(State(state.clone()), headers("first"), Path("req-9".to_string()), start_body())
            .await
            .expect("first start");

        let error = start_instance(
            State(state),
            headers("second"),
            Path("req-9".to_string()),
            start_body(),
        )
        .await
        .expect_err("second start must conflict");

        assert_eq!(error.status(), StatusCode::CONFLICT);
        assert_eq!(error.0.correlation_id(), "second");
    }

    #[tokio::test]
    async fn unknown_request_and_bad_decision_are_bad_requests() {
        let state = ApiState::new(seeded().await, &AppConfig::default());

        let missing = start_instance(
            State(state.clone()),
            HeaderMap::new(),
            Path("req-missing".to_string()),
            start_body(),
        )
        .await
        .expect_err("missing request");
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert!(!missing.0.correlation_id().is_empty());

        let invalid = record_decision(
            State(state),
            HeaderMap::new(),
            Path("step-x".to_string()),
            Json(DecisionBody {
                decision: "maybe".to_string(),
                actor_id: "manager".to_string(),
                note: None,
            }),
        )
        .await
        .expect_err("invalid decision");
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert!(invalid.0.message().contains("maybe"));
    }

    #[tokio::test]
    async fn picker_returns_synced_nodes_and_rejects_unknown_mode() {
        let pool = seeded().await;
        SqlDirectoryRepository::new(pool.clone())
            .upsert_legacy_unit(&LegacyOrgEntity {
                key: LegacyKey::new(LegacyKind::Directorate, 4),
                names: DisplayNames::new("Finance"),
                code: Some("FIN".to_string()),
                active: true,
                parents: Default::default(),
            })
            .await
            .expect("legacy unit");
        SqlOrgRepository::new(pool.clone()).sync(Utc::now(), "sync").await.expect("sync");
        let state = ApiState::new(pool, &AppConfig::default());

        let Json(nodes) = org_picker(
            State(state.clone()),
            HeaderMap::new(),
            Query(PickerQuery { mode: Some("approvals".to_string()) }),
        )
        .await
        .expect("picker");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].code.as_deref(), Some("FIN"));
        assert!(nodes[0].eligible);

        let Json(chart) = org_chart(State(state.clone()), HeaderMap::new()).await.expect("chart");
        assert_eq!(chart.len(), 1);
        assert_eq!(chart[0].code.as_deref(), Some("FIN"));

        let error = org_picker(
            State(state),
            HeaderMap::new(),
            Query(PickerQuery { mode: Some("sideways".to_string()) }),
        )
        .await
        .expect_err("unknown mode");
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn router_serves_health_and_error_bodies() {
        let app = router(ApiState::new(seeded().await, &AppConfig::default()));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("health response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/requests/req-missing/instance")
                    .header("content-type", "application/json")
                    .header(CORRELATION_HEADER, "corr-404")
                    .body(Body::from(r#"{"template_id":"tpl-leave","actor_id":"requester"}"#))
                    .expect("request"),
            )
            .await
            .expect("start response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["correlation_id"], "corr-404");
        assert!(body["message"].as_str().expect("message").contains("req-missing"));
    }
}
