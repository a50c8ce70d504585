//! Request handling behind the HTTP layer: status, reads, JSON writes and CSV uploads.
//!
//! Every call returns a [`Response`] carrying the status code and JSON body to send. Errors caused
//! by the request become `400`s with the error message; anything else is logged and becomes a
//! `500`.
use serde_json::{json, Value as Json};
use tracing::{error, info, instrument, warn};

use crate::{
    bucket::{Bucket, Database},
    config::Config,
    error::{BucketError, Result},
    ingest::parse_csv,
    query::Query,
    query_validation::validate_request_args,
    record::RawRecord,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Json,
}

impl Response {
    fn ok(body: Json) -> Self {
        Self { status: 200, body }
    }

    fn error<S: Into<String>>(status: u16, message: S) -> Self {
        Self {
            status,
            body: json!({"status": "error", "message": message.into()}),
        }
    }

    fn from_error(e: BucketError) -> Self {
        if e.is_request_error() {
            warn!(error = %e, "rejected request");
            Self::error(400, e.to_string())
        } else {
            error!(error = %e, "request failed");
            Self::error(500, "Internal Server Error")
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct Service {
    config: Config,
    database: Database,
}

impl Service {
    pub fn new(config: Config, database: Database) -> Self {
        Self { config, database }
    }

    /// Opens the configured storage and wraps it in a service.
    pub fn from_config(config: Config) -> Result<Self> {
        let storage = config.open_storage()?;
        let database = Database::new(storage, config.database_name.clone());
        Ok(Self::new(config, database))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> Response {
        if self.database.alive() {
            Response::ok(json!({"status": "ok", "message": "database seems fine"}))
        } else {
            Response::error(500, "cannot connect to database")
        }
    }

    #[instrument(skip(self, params), fields(params = params.len()))]
    pub fn read(&self, bucket: &str, params: &[(String, String)]) -> Response {
        let validation = validate_request_args(params, self.config.raw_queries_allowed(bucket));
        if let Some(message) = validation.message() {
            warn!(bucket, message, "invalid read request");
            return Response::error(400, message);
        }
        match self.run_query(bucket, params) {
            Ok(data) => Response::ok(json!({ "data": data })),
            Err(e) => Response::from_error(e),
        }
    }

    fn run_query(&self, bucket: &str, params: &[(String, String)]) -> Result<Json> {
        let bucket = Bucket::new(&self.database, bucket)?;
        let query = Query::parse(params)?;
        Ok(bucket.query(&query)?.data())
    }

    /// Stores a JSON object, or a list of them, after checking the bucket's bearer token.
    #[instrument(skip(self, auth_header, body), fields(bytes = body.len()))]
    pub fn write(&self, bucket: &str, auth_header: Option<&str>, body: &[u8]) -> Response {
        if !self.config.tokens.authorized(bucket, auth_header) {
            return Response::error(403, "Forbidden");
        }
        let Ok(payload) = serde_json::from_slice::<Json>(body) else {
            warn!(bucket, "request body is not JSON");
            return Response::error(400, "Request must be JSON");
        };
        let result = prepare_records(payload).and_then(|records| {
            info!(bucket, documents = records.len(), "request contains documents");
            self.store(bucket, records)
        });
        match result {
            Ok(()) => Response::ok(json!({"status": "ok"})),
            Err(e) => Response::from_error(e),
        }
    }

    /// Stores the rows of an uploaded CSV file, authorized by the bucket's bearer token.
    pub fn upload_csv(&self, bucket: &str, auth_header: Option<&str>, bytes: &[u8]) -> Response {
        if !self.config.tokens.authorized(bucket, auth_header) {
            return Response::error(403, "Forbidden");
        }
        self.ingest_csv(bucket, bytes)
    }

    /// Stores the rows of an uploaded CSV file on behalf of a signed in user.
    pub fn upload_csv_as(&self, user: &str, bucket: &str, bytes: &[u8]) -> Response {
        if !self.config.permissions.allowed(user, bucket) {
            warn!(user, bucket, "user may not upload to bucket");
            return Response::error(403, "Forbidden");
        }
        self.ingest_csv(bucket, bytes)
    }

    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    fn ingest_csv(&self, bucket: &str, bytes: &[u8]) -> Response {
        if bytes.len() > self.config.max_upload_size {
            warn!(limit = self.config.max_upload_size, "upload too large");
            return Response::error(411, "Length Required");
        }
        let result = parse_csv(bytes, None).and_then(|records| self.store(bucket, records));
        match result {
            Ok(()) => Response::ok(json!({"status": "ok"})),
            Err(e) => Response::from_error(e),
        }
    }

    fn store(&self, bucket: &str, records: Vec<RawRecord>) -> Result<()> {
        Bucket::new(&self.database, bucket)?.store(records)?;
        Ok(())
    }
}

/// A single object becomes one record, a list of objects one record each.
fn prepare_records(payload: Json) -> Result<Vec<RawRecord>> {
    let items = match payload {
        Json::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| match item {
            Json::Object(record) => Ok(record),
            _ => Err(BucketError::Validation(
                "Each record must be a JSON object".to_string(),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use super::*;
    use crate::{
        group::GroupRow,
        permissions::{BucketTokens, Permissions},
        query::{Filter, Sort},
        record::Record,
        storage::{MemoryStorage, Storage},
    };

    const TOKEN: &str = "Bearer foo-bearer-token";

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn service() -> Service {
        let mut config = Config::default();
        config.tokens = BucketTokens::new(BTreeMap::from([(
            "foo".to_string(),
            "foo-bearer-token".to_string(),
        )]));
        config.permissions = Permissions::new(BTreeMap::from([(
            "bob@example.com".to_string(),
            vec!["foo".to_string()],
        )]));
        config.raw_queries_allowed.insert("foo".to_string(), true);
        let database = Database::new(Arc::new(MemoryStorage::new()), "test");
        Service::new(config, database)
    }

    struct DownStorage;

    impl Storage for DownStorage {
        fn find(
            &self,
            _: &str,
            _: &Filter,
            _: Option<&Sort>,
            _: Option<usize>,
        ) -> Result<Vec<Record>> {
            Err(BucketError::Storage("connection refused".into()))
        }

        fn group(&self, _: &str, _: &[String], _: &Filter, _: &[String]) -> Result<Vec<GroupRow>> {
            Err(BucketError::Storage("connection refused".into()))
        }

        fn save(&self, _: &str, _: Record) -> Result<()> {
            Err(BucketError::TransientStorage("connection refused".into()))
        }

        fn alive(&self) -> bool {
            false
        }
    }

    fn down_service() -> Service {
        let mut config = Config::default();
        config.raw_queries_allowed.insert("foo".to_string(), true);
        config.tokens.insert("foo", "foo-bearer-token");
        Service::new(config, Database::new(Arc::new(DownStorage), "test"))
    }

    #[test]
    fn status_reflects_database_health() {
        let response = service().status();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.body,
            json!({"status": "ok", "message": "database seems fine"})
        );

        let response = down_service().status();
        assert_eq!(response.status, 500);
        assert_eq!(
            response.body,
            json!({"status": "error", "message": "cannot connect to database"})
        );
    }

    #[test]
    fn write_requires_the_bucket_token() {
        let service = service();
        let body = br#"{"name": "x"}"#;
        for header in [None, Some("Bearer wrong"), Some("Bearer")] {
            let response = service.write("foo", header, body);
            assert_eq!(response.status, 403);
            assert_eq!(response.body["message"], "Forbidden");
        }
        assert_eq!(service.write("bar", Some(TOKEN), body).status, 403);
    }

    #[test]
    fn write_requires_json() {
        let response = service().write("foo", Some(TOKEN), b"name=x");
        assert_eq!(response.status, 400);
        assert_eq!(response.body["message"], "Request must be JSON");
    }

    #[test]
    fn write_accepts_an_object_or_a_list() {
        let service = service();
        let response = service.write("foo", Some(TOKEN), br#"{"name": "one"}"#);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"status": "ok"}));
        let response = service.write(
            "foo",
            Some(TOKEN),
            br#"[{"name": "two"}, {"name": "three"}]"#,
        );
        assert_eq!(response.status, 200);

        let response = service.read("foo", &[]);
        assert_eq!(response.status, 200);
        assert_eq!(response.body["data"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn write_rejects_invalid_records() {
        let service = service();
        let response = service.write("foo", Some(TOKEN), br#"{"_bad": 1}"#);
        assert_eq!(response.status, 400);
        assert_eq!(response.body["status"], "error");
        let response = service.write("foo", Some(TOKEN), br#"[1, 2]"#);
        assert_eq!(response.status, 400);
    }

    #[test]
    fn storage_failures_are_server_errors() {
        let service = down_service();
        assert_eq!(
            service.write("foo", Some(TOKEN), br#"{"name": "x"}"#).status,
            500
        );
        assert_eq!(service.read("foo", &[]).status, 500);
    }

    #[test]
    fn read_validates_arguments() {
        let service = service();
        let response = service.read("foo", &params(&[("limit", "lots")]));
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body,
            json!({"status": "error", "message": "limit is not a valid number"})
        );
    }

    #[test]
    fn raw_reads_need_permission_per_bucket() {
        let service = service();
        assert_eq!(service.read("foo", &[]).status, 200);
        let response = service.read("bar", &[]);
        assert_eq!(response.status, 400);
        assert_eq!(response.body["message"], "querying for raw data is not allowed");
        assert_eq!(
            service.read("bar", &params(&[("group_by", "name")])).status,
            200
        );
    }

    #[test]
    fn read_groups() {
        let service = service();
        service.write(
            "foo",
            Some(TOKEN),
            br#"[{"name": "a"}, {"name": "b"}, {"name": "a"}]"#,
        );
        let response = service.read(
            "foo",
            &params(&[("group_by", "name"), ("sort_by", "_count:descending")]),
        );
        assert_eq!(response.status, 200);
        assert_eq!(
            response.body,
            json!({"data": [{"name": "a", "_count": 2}, {"name": "b", "_count": 1}]})
        );
    }

    #[test]
    fn upload_stores_csv_rows() {
        let service = service();
        let response = service.upload_csv("foo", Some(TOKEN), b"name,size\nmug,12\nbottle,123");
        assert_eq!(response.status, 200);
        let data = service.read("foo", &[]).body;
        assert_eq!(data["data"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn upload_rejects_bad_csv_and_large_files() {
        let service = service();
        let response = service.upload_csv("foo", Some(TOKEN), b"a,b\nx,y,z");
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body["message"],
            "Some rows in the CSV file contain more values than columns"
        );

        let large = vec![b'a'; service.config().max_upload_size + 1];
        assert_eq!(service.upload_csv("foo", Some(TOKEN), &large).status, 411);
        assert_eq!(service.upload_csv("foo", None, b"a\n1").status, 403);
    }

    #[test]
    fn uploads_by_users_follow_permissions() {
        let service = service();
        assert_eq!(
            service.upload_csv_as("bob@example.com", "foo", b"a\n1").status,
            200
        );
        assert_eq!(
            service.upload_csv_as("bob@example.com", "bar", b"a\n1").status,
            403
        );
    }
}
