//! Router tests against an in-memory store and a recording dispatcher.

use std::{
  convert::Infallible,
  sync::{Arc, Mutex},
  time::Duration,
};

use axum::{
  Router,
  body::{Body, to_bytes},
  http::{Request, StatusCode},
};
use roster_core::{
  dispatch::{Job, SubjectRef, TaskDispatcher},
  patient::{NewPatient, RegistryId},
  store::PatientStore,
};
use roster_store_sqlite::SqliteStore;
use serde_json::{Value, json};
use tower::ServiceExt as _;
use uuid::Uuid;

#[derive(Default)]
struct Recorder {
  jobs: Mutex<Vec<Job>>,
}

impl Recorder {
  fn jobs(&self) -> Vec<Job> { self.jobs.lock().unwrap().clone() }
}

impl TaskDispatcher for Recorder {
  type Error = Infallible;

  async fn schedule(&self, job: Job, _delay: Option<Duration>) -> Result<(), Infallible> {
    self.jobs.lock().unwrap().push(job);
    Ok(())
  }
}

struct Harness {
  store:      Arc<SqliteStore>,
  dispatcher: Arc<Recorder>,
  router:     Router,
}

async fn harness() -> Harness {
  let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
  let dispatcher = Arc::new(Recorder::default());
  let router = crate::api_router(store.clone(), dispatcher.clone());
  Harness { store, dispatcher, router }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
  let request = Request::builder()
    .method(method)
    .uri(uri)
    .header("content-type", "application/json")
    .body(match body {
      Some(v) => Body::from(v.to_string()),
      None => Body::empty(),
    })
    .unwrap();
  let response = router.clone().oneshot(request).await.unwrap();
  let status = response.status();
  let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
  let value = if bytes.is_empty() {
    Value::Null
  } else {
    serde_json::from_slice(&bytes).unwrap()
  };
  (status, value)
}

fn smith(registry_id: Option<&str>) -> Value {
  json!({
    "given_name": "Jo",
    "family_name": "Smith",
    "date_of_birth": "2010-05-01",
    "postcode": "AB1 2CD",
    "registry_id": registry_id,
  })
}

#[tokio::test]
async fn create_then_fetch_patient() {
  let h = harness().await;
  let (status, created) = call(&h.router, "POST", "/patients", Some(smith(None))).await;
  assert_eq!(status, StatusCode::CREATED);

  let id = created["patient_id"].as_str().unwrap();
  let (status, fetched) = call(&h.router, "GET", &format!("/patients/{id}"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(fetched["demographics"]["family_name"], "Smith");
  assert!(fetched["registry_id"].is_null());
}

#[tokio::test]
async fn duplicate_registry_id_is_a_conflict() {
  let h = harness().await;
  let (status, _) = call(&h.router, "POST", "/patients", Some(smith(Some("9000000009")))).await;
  assert_eq!(status, StatusCode::CREATED);
  let (status, body) =
    call(&h.router, "POST", "/patients", Some(smith(Some("9000000009")))).await;
  assert_eq!(status, StatusCode::CONFLICT);
  assert!(body["error"].as_str().unwrap().contains("9000000009"));
}

#[tokio::test]
async fn unknown_patient_is_not_found() {
  let h = harness().await;
  let (status, body) =
    call(&h.router, "GET", &format!("/patients/{}", Uuid::new_v4()), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert!(body["error"].is_string());
}

#[tokio::test]
async fn resolve_enqueues_a_direct_search() {
  let h = harness().await;
  let (_, created) = call(&h.router, "POST", "/patients", Some(smith(None))).await;
  let id: Uuid = serde_json::from_value(created["patient_id"].clone()).unwrap();

  let (status, _) = call(&h.router, "POST", &format!("/patients/{id}/resolve"), None).await;
  assert_eq!(status, StatusCode::ACCEPTED);

  let jobs = h.dispatcher.jobs();
  assert_eq!(jobs.len(), 1);
  assert!(matches!(
    &jobs[0],
    Job::Search(task) if task.subject == SubjectRef::Patient(id) && task.step.is_none()
  ));
}

#[tokio::test]
async fn refresh_requires_an_identifier() {
  let h = harness().await;
  let (_, unresolved) = call(&h.router, "POST", "/patients", Some(smith(None))).await;
  let id = unresolved["patient_id"].as_str().unwrap();
  let (status, _) = call(&h.router, "POST", &format!("/patients/{id}/refresh"), None).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(h.dispatcher.jobs().is_empty());

  let (_, resolved) =
    call(&h.router, "POST", "/patients", Some(smith(Some("9000000009")))).await;
  let id = resolved["patient_id"].as_str().unwrap();
  let (status, _) = call(&h.router, "POST", &format!("/patients/{id}/refresh"), None).await;
  assert_eq!(status, StatusCode::ACCEPTED);
  assert!(matches!(h.dispatcher.jobs().as_slice(), [Job::Refresh { .. }]));
}

#[tokio::test]
async fn merge_folds_casualty_into_survivor() {
  let h = harness().await;
  let survivor = h
    .store
    .add_patient(NewPatient {
      registry_id:  Some(RegistryId::new("9000000009")),
      demographics: serde_json::from_value(smith(None)).unwrap(),
    })
    .await
    .unwrap();
  let casualty = h
    .store
    .add_patient(NewPatient {
      registry_id:  None,
      demographics: serde_json::from_value(smith(None)).unwrap(),
    })
    .await
    .unwrap();
  h.store.add_consent(casualty.patient_id, "given").await.unwrap();

  let uri = format!("/patients/{}/merge", survivor.patient_id);
  let (status, report) = call(
    &h.router,
    "POST",
    &uri,
    Some(json!({ "casualty": casualty.patient_id })),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(report["survivor"], json!(survivor.patient_id));

  assert!(h.store.get_patient(casualty.patient_id).await.unwrap().is_none());
  let aggregate = h.store.aggregate(survivor.patient_id).await.unwrap().unwrap();
  assert_eq!(aggregate.consents.len(), 1);
}

#[tokio::test]
async fn merge_rejects_self_and_missing_casualty() {
  let h = harness().await;
  let (_, created) = call(&h.router, "POST", "/patients", Some(smith(None))).await;
  let id = created["patient_id"].as_str().unwrap();
  let uri = format!("/patients/{id}/merge");

  let (status, _) = call(&h.router, "POST", &uri, Some(json!({ "casualty": id }))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let (status, _) =
    call(&h.router, "POST", &uri, Some(json!({ "casualty": Uuid::new_v4() }))).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test]
fn store_constraint_violations_are_conflicts() {
  use axum::response::IntoResponse as _;
  use roster_store_sqlite::Error as StoreError;

  let status = |e: StoreError| crate::ApiError::store(e).into_response().status();

  assert_eq!(
    status(StoreError::MergeConflict("consent changed owner during merge".into())),
    StatusCode::CONFLICT
  );
  assert_eq!(
    status(StoreError::DuplicateRegistryId {
      registry_id: "9000000009".into(),
      holder:      Uuid::new_v4(),
    }),
    StatusCode::CONFLICT
  );
  assert_eq!(
    status(StoreError::DateParse("not a date".into())),
    StatusCode::INTERNAL_SERVER_ERROR
  );
}

#[tokio::test]
async fn import_stages_rows_and_enqueues_batch_searches() {
  let h = harness().await;
  let row = |n: u32| {
    json!({
      "row_number": n,
      "demographics": {
        "given_name": "Jo",
        "family_name": "Smith",
        "date_of_birth": "2010-05-01",
        "postcode": "AB1 2CD",
      },
    })
  };
  let (status, import) =
    call(&h.router, "POST", "/imports", Some(json!({ "rows": [row(1), row(2)] }))).await;
  assert_eq!(status, StatusCode::ACCEPTED);
  assert_eq!(import["status"], "pending");

  let jobs = h.dispatcher.jobs();
  assert_eq!(jobs.len(), 2);
  assert!(jobs.iter().all(|j| matches!(
    j,
    Job::Search(task) if matches!(task.subject, SubjectRef::Changeset(_))
  )));

  let id = import["import_id"].as_str().unwrap();
  let (status, view) = call(&h.router, "GET", &format!("/imports/{id}"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(view["rows"].as_array().unwrap().len(), 2);
  assert_eq!(view["rows"][0]["status"], "pending");
}

#[tokio::test]
async fn import_rejects_repeated_row_numbers() {
  let h = harness().await;
  let row = json!({
    "row_number": 1,
    "demographics": {
      "given_name": "Jo",
      "family_name": "Smith",
      "date_of_birth": "2010-05-01",
    },
  });
  let (status, _) =
    call(&h.router, "POST", "/imports", Some(json!({ "rows": [row.clone(), row] }))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(h.dispatcher.jobs().is_empty());
}
