use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use super::ws;
use crate::error::{Result, TriageError};
use crate::notify::BroadcastNotifier;
use crate::patient::{EsiLevel, IntakeForm};
use crate::queue::QueueStatus;
use crate::service::TriageService;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        ApiResponse {
            status: "success".to_string(),
            message: message.into(),
            data: Some(data),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        ApiResponse {
            status: "error".to_string(),
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
    limit: Option<usize>,
    esi_level: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AcknowledgeQuery {
    by: Option<String>,
}

pub struct RestApi {
    service: Arc<TriageService>,
    notifier: Arc<BroadcastNotifier>,
}

impl RestApi {
    pub fn new(service: Arc<TriageService>, notifier: Arc<BroadcastNotifier>) -> Self {
        RestApi { service, notifier }
    }

    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        self.post_patient()
            .or(self.reassess_patient())
            .or(self.get_assessments())
            .or(self.get_queue())
            .or(self.queue_action())
            .or(self.get_alerts())
            .or(self.get_alert())
            .or(self.acknowledge_alert())
            .or(self.get_dashboard())
            .or(ws::route(Arc::clone(&self.service), Arc::clone(&self.notifier)))
            .recover(handle_rejection)
    }

    fn post_patient(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "patients")
            .and(warp::post())
            .and(json_body())
            .and_then(move |form: IntakeForm| {
                let service = Arc::clone(&service);
                async move {
                    let result = match form.normalize() {
                        Ok(snapshot) => service.assess_and_enqueue(snapshot).await,
                        Err(e) => Err(e),
                    };
                    Ok::<_, Infallible>(respond(result, "Patient assessed and queued", StatusCode::CREATED))
                }
            })
    }

    fn reassess_patient(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "patients" / String / "assess")
            .and(warp::post())
            .and(json_body())
            .and_then(move |patient_id: String, mut form: IntakeForm| {
                let service = Arc::clone(&service);
                async move {
                    let result = match form.patient_id.as_deref() {
                        Some(body_id) if body_id.trim() != patient_id => Err(TriageError::Validation(format!(
                            "body patient_id {} does not match path {}",
                            body_id, patient_id
                        ))),
                        _ => {
                            form.patient_id = Some(patient_id.clone());
                            match form.normalize() {
                                Ok(snapshot) => service.reassess(&patient_id, snapshot).await,
                                Err(e) => Err(e),
                            }
                        }
                    };
                    Ok::<_, Infallible>(respond(result, "Patient reassessed", StatusCode::OK))
                }
            })
    }

    fn get_assessments(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "patients" / String / "assessments")
            .and(warp::get())
            .map(move |patient_id: String| respond(service.history(&patient_id), "Assessment history", StatusCode::OK))
    }

    fn get_queue(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "queue")
            .and(warp::get())
            .and(warp::query::<QueueQuery>())
            .map(move |query: QueueQuery| {
                let filter = match query.esi_level {
                    None => Ok(None),
                    Some(level) => EsiLevel::from_u8(level)
                        .map(Some)
                        .ok_or_else(|| TriageError::Validation(format!("esi_level must be 1-5, got {}", level))),
                };
                let result = filter.map(|filter| service.list_waiting(query.limit, filter));
                respond(result, "Waiting queue", StatusCode::OK)
            })
    }

    fn queue_action(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "queue" / String / String)
            .and(warp::post())
            .and_then(move |patient_id: String, action: String| {
                let service = Arc::clone(&service);
                async move {
                    let target = match action.as_str() {
                        "start-treatment" => QueueStatus::InTreatment,
                        "complete-treatment" => QueueStatus::Completed,
                        "discharge" => QueueStatus::Discharged,
                        _ => return Err(warp::reject::not_found()),
                    };
                    let result = service.transition(&patient_id, target).await;
                    Ok(respond(result, format!("Patient moved to {}", target), StatusCode::OK))
                }
            })
    }

    fn get_alerts(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "alerts")
            .and(warp::get())
            .and(warp::query::<AlertQuery>())
            .map(move |query: AlertQuery| {
                let alerts = service.active_alerts(query.limit.unwrap_or(20).min(100));
                respond(Ok(alerts), "Active alerts", StatusCode::OK)
            })
    }

    fn get_alert(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "alerts" / Uuid)
            .and(warp::get())
            .map(move |alert_id: Uuid| respond(service.alert(alert_id), "Alert", StatusCode::OK))
    }

    fn acknowledge_alert(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "alerts" / Uuid / "acknowledge")
            .and(warp::post())
            .and(warp::query::<AcknowledgeQuery>())
            .and_then(move |alert_id: Uuid, query: AcknowledgeQuery| {
                let service = Arc::clone(&service);
                async move {
                    let by = query.by.unwrap_or_default();
                    let result = service.acknowledge_alert(alert_id, &by).await;
                    Ok::<_, Infallible>(respond(result, "Alert acknowledged", StatusCode::OK))
                }
            })
    }

    fn get_dashboard(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let service = Arc::clone(&self.service);

        warp::path!("api" / "v1" / "dashboard")
            .and(warp::get())
            .map(move || respond(Ok(service.dashboard_snapshot()), "Dashboard", StatusCode::OK))
    }
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn respond<T: Serialize>(result: Result<T>, message: impl Into<String>, success: StatusCode) -> WithStatus<Json> {
    let (response, status) = match result.and_then(|data| {
        serde_json::to_value(data).map_err(|e| TriageError::Storage(format!("Failed to encode response: {}", e)))
    }) {
        Ok(data) => (ApiResponse::success(message, data), success),
        Err(e) => (ApiResponse::error(e.to_string()), error_status(&e)),
    };
    warp::reply::with_status(warp::reply::json(&response), status)
}

fn error_status(error: &TriageError) -> StatusCode {
    match error {
        TriageError::Validation(_) => StatusCode::BAD_REQUEST,
        TriageError::PatientNotFound(_) | TriageError::AlertNotFound(_) => StatusCode::NOT_FOUND,
        TriageError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_rejection(err: Rejection) -> std::result::Result<WithStatus<Json>, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Resource not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, format!("Invalid query: {}", e))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        tracing::error!(rejection = ?err, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::error(message)),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ThresholdConfig};
    use crate::storage::MemoryStore;
    use crate::triage::RuleBasedClassifier;
    use serde_json::{json, Value};

    fn api() -> RestApi {
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let service = Arc::new(TriageService::new(
            &Config::default(),
            Arc::new(RuleBasedClassifier::new(ThresholdConfig::default())),
            Arc::new(MemoryStore::new()),
            notifier.clone(),
        ));
        RestApi::new(service, notifier)
    }

    fn body(response: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    async fn admit<F>(routes: &F, id: &str)
    where
        F: Filter + 'static,
        F::Extract: Reply + Send,
    {
        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/patients")
            .json(&json!({"patient_id": id, "age": 45, "chief_complaint": "chest pain", "pain_scale": 8}))
            .reply(routes)
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn intake_assesses_and_queues() {
        let routes = api().routes();

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/patients")
            .json(&json!({"patient_id": "p-1", "age": 45, "chief_complaint": "chest pain"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body(&response);
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["assessment"]["esi_level"], 2);
        assert_eq!(json["data"]["queue_position"], 1);

        let response = warp::test::request().path("/api/v1/queue?limit=5").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["data"][0]["entry"]["patient_id"], "p-1");
    }

    #[tokio::test]
    async fn intake_without_age_is_rejected() {
        let routes = api().routes();
        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/patients")
            .json(&json!({"patient_id": "p-1"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&response)["status"], "error");
    }

    #[tokio::test]
    async fn transitions_map_errors_to_status_codes() {
        let routes = api().routes();
        admit(&routes, "p-1").await;

        let complete = warp::test::request()
            .method("POST")
            .path("/api/v1/queue/p-1/complete-treatment")
            .reply(&routes)
            .await;
        assert_eq!(complete.status(), StatusCode::CONFLICT);

        let missing = warp::test::request()
            .method("POST")
            .path("/api/v1/queue/nobody/start-treatment")
            .reply(&routes)
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let start = warp::test::request()
            .method("POST")
            .path("/api/v1/queue/p-1/start-treatment")
            .reply(&routes)
            .await;
        assert_eq!(start.status(), StatusCode::OK);
        assert_eq!(body(&start)["data"]["status"], "in_treatment");

        let unknown = warp::test::request()
            .method("POST")
            .path("/api/v1/queue/p-1/teleport")
            .reply(&routes)
            .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_rejects_bad_esi_filter() {
        let routes = api().routes();
        let response = warp::test::request().path("/api/v1/queue?esi_level=9").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn alerts_can_be_listed_and_acknowledged() {
        let routes = api().routes();
        admit(&routes, "p-1").await;

        let response = warp::test::request().path("/api/v1/alerts").reply(&routes).await;
        let alerts = body(&response)["data"].clone();
        assert_eq!(alerts.as_array().unwrap().len(), 1);
        let id = alerts[0]["id"].as_str().unwrap().to_string();

        let response = warp::test::request()
            .method("POST")
            .path(&format!("/api/v1/alerts/{}/acknowledge?by=charge-nurse", id))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["data"]["acknowledged_by"], "charge-nurse");

        let response = warp::test::request().path(&format!("/api/v1/alerts/{}", id)).reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["data"]["acknowledged"], true);

        let response = warp::test::request()
            .path(&format!("/api/v1/alerts/{}", Uuid::new_v4()))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = warp::test::request()
            .method("POST")
            .path(&format!("/api/v1/alerts/{}/acknowledge?by=x", Uuid::new_v4()))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reassessment_and_history() {
        let routes = api().routes();
        admit(&routes, "p-1").await;

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/patients/p-1/assess")
            .json(&json!({"age": 45, "consciousness_level": "unresponsive"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["data"]["assessment"]["esi_level"], 1);

        let mismatch = warp::test::request()
            .method("POST")
            .path("/api/v1/patients/p-1/assess")
            .json(&json!({"patient_id": "p-2", "age": 45}))
            .reply(&routes)
            .await;
        assert_eq!(mismatch.status(), StatusCode::BAD_REQUEST);

        let history = warp::test::request().path("/api/v1/patients/p-1/assessments").reply(&routes).await;
        assert_eq!(body(&history)["data"].as_array().unwrap().len(), 2);

        let dashboard = warp::test::request().path("/api/v1/dashboard").reply(&routes).await;
        assert_eq!(body(&dashboard)["data"]["waiting_patients"], 1);
    }
}
