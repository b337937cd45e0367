use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
}

/// Local plain-HTTP stand-in for the platform. Answers each known path with a
/// canned JSON body, anything else with 404, and records every request.
pub struct FakePlatform {
    pub base: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    task: JoinHandle<()>,
}

impl FakePlatform {
    pub async fn start(routes: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes: Arc<HashMap<String, String>> = Arc::new(
            routes
                .iter()
                .map(|(path, body)| (path.to_string(), body.to_string()))
                .collect(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let seen = Arc::clone(&seen);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    let seen = Arc::clone(&seen);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let reply = answer(&req, &routes, &seen);
                            async move { Ok::<_, Infallible>(reply) }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            }
        });

        Self { base, seen, task }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for FakePlatform {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn answer(
    req: &Request<Incoming>,
    routes: &HashMap<String, String>,
    seen: &Mutex<Vec<SeenRequest>>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let query = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    seen.lock().unwrap().push(SeenRequest {
        method: req.method().to_string(),
        path: path.clone(),
        query,
        authorization,
    });

    match routes.get(&path) {
        Some(body) => Response::new(Full::new(Bytes::from(body.clone()))),
        None => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}
