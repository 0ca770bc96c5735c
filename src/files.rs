use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::client::Endpoints;
use crate::constants::FILE_LIST_PAGE_SIZE;
use crate::error::Result;
use crate::http::{BatchExecutor, HttpRequest};
use crate::types::{ListFilesResponse, UploadedFile};

pub trait FileLister: Send + Sync {
    fn list_files(&self) -> Result<Vec<UploadedFile>>;
}

pub struct FilesApi {
    executor: Arc<dyn BatchExecutor>,
    credentials: Credentials,
    endpoints: Endpoints,
}

impl FilesApi {
    pub fn new(executor: Arc<dyn BatchExecutor>, credentials: Credentials, endpoints: Endpoints) -> Self {
        Self {
            executor,
            credentials,
            endpoints,
        }
    }

    pub fn get_file(&self, name: &str) -> Result<UploadedFile> {
        let url = self.endpoints.file_url(name, &self.credentials)?;
        let request = self.credentials.authorize(HttpRequest::get(url))?;
        self.executor.send(request)?.ensure_ok()?.json()
    }

    /// Returns one value per name in input order: `{}` for a deleted file, the service's error
    /// payload otherwise. Individual failures never abort the remaining deletes.
    pub fn delete_files(&self, names: &[String], wave_size: usize) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(names.len());
        for (idx, wave) in names.chunks(wave_size.max(1)).enumerate() {
            let requests = wave
                .iter()
                .map(|name| {
                    let url = self.endpoints.file_url(name, &self.credentials)?;
                    self.credentials.authorize(HttpRequest::delete(url))
                })
                .collect::<Result<Vec<_>>>()?;
            debug!("delete wave {}: {} request(s)", idx + 1, requests.len());
            for (name, outcome) in wave.iter().zip(self.executor.execute(requests)) {
                let value = match outcome {
                    Ok(resp) if resp.is_success() => {
                        if resp.body.is_empty() {
                            json!({})
                        } else {
                            resp.json().unwrap_or_else(|_| json!({}))
                        }
                    }
                    Ok(resp) => {
                        warn!("deleting {name} failed with status {}", resp.status);
                        resp.json()
                            .unwrap_or_else(|_| json!({ "error": { "code": resp.status, "message": resp.text() } }))
                    }
                    Err(err) => {
                        warn!("deleting {name} failed: {err}");
                        json!({ "error": { "message": err.to_string() } })
                    }
                };
                results.push(value);
            }
        }
        info!("processed {} delete request(s)", results.len());
        Ok(results)
    }
}

impl FileLister for FilesApi {
    fn list_files(&self) -> Result<Vec<UploadedFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("pageSize", FILE_LIST_PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let url = self.endpoints.files_url(&query, &self.credentials)?;
            let request = self.credentials.authorize(HttpRequest::get(url))?;
            let page: ListFilesResponse = self.executor.send(request)?.ensure_ok()?.json()?;
            files.extend(page.files);
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!("listed {} file(s)", files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::http::HttpResponse;
    use crate::testing::ScriptedExecutor;

    fn api(executor: Arc<ScriptedExecutor>) -> FilesApi {
        FilesApi::new(executor, Credentials::api_key("k"), Endpoints::default())
    }

    #[test]
    fn listing_follows_page_tokens() {
        let executor = Arc::new(ScriptedExecutor::new(|req| {
            if req.url.contains("pageToken=p2") {
                HttpResponse::new(200, r#"{"files":[{"name":"files/c"}]}"#)
            } else {
                HttpResponse::new(
                    200,
                    r#"{"files":[{"name":"files/a"},{"name":"files/b"}],"nextPageToken":"p2"}"#,
                )
            }
        }));
        let files = api(executor.clone()).list_files().unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["files/a", "files/b", "files/c"]);

        let requests = executor.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.contains("pageSize=100"));
        assert!(requests[0].url.contains("key=k"));
        assert!(!requests[0].url.contains("pageToken"));
    }

    #[test]
    fn listing_error_keeps_body() {
        let executor = Arc::new(ScriptedExecutor::new(|_| HttpResponse::new(403, "denied")));
        let err = api(executor).list_files().unwrap_err();
        assert!(matches!(err, Error::Service { status: 403, ref body } if body == "denied"));
    }

    #[test]
    fn delete_sends_nothing_for_empty_input() {
        let executor = Arc::new(ScriptedExecutor::new(|_| HttpResponse::new(200, "")));
        assert!(api(executor.clone()).delete_files(&[], 50).unwrap().is_empty());
        assert!(executor.wave_sizes().is_empty());
    }

    #[test]
    fn delete_reports_each_name_in_order() {
        let executor = Arc::new(ScriptedExecutor::new(|req| {
            if req.url.contains("files/gone") {
                HttpResponse::new(404, r#"{"error":{"code":404}}"#)
            } else {
                HttpResponse::new(200, "")
            }
        }));
        let names: Vec<String> = ["files/a", "files/gone", "files/b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let results = api(executor.clone()).delete_files(&names, 2).unwrap();
        assert_eq!(results[0], json!({}));
        assert_eq!(results[1], json!({"error": {"code": 404}}));
        assert_eq!(results[2], json!({}));
        assert_eq!(executor.wave_sizes(), vec![2, 1]);
        assert!(executor
            .requests()
            .iter()
            .all(|r| r.method == reqwest::Method::DELETE));
    }
}
