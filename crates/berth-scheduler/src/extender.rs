use crate::config::ExtenderConfig;
use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use berth_core::{Binding, Pod};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Nodes that passed an extender's filter, plus the reasons for the rest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtenderFilterResult {
    pub node_names: Vec<String>,
    pub failed_nodes: HashMap<String, String>,
}

/// A filtering/binding delegate outside the plugin pipeline
#[async_trait]
pub trait Extender: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this extender performs binding
    fn is_binder(&self) -> bool;

    /// Whether the pod concerns this extender at all
    fn is_interested(&self, pod: &Pod) -> bool;

    /// Whether failures of this extender may be skipped
    fn is_ignorable(&self) -> bool {
        false
    }

    /// Narrow `node_names` down to the nodes the extender accepts
    async fn filter(&self, pod: &Pod, node_names: &[String]) -> Result<ExtenderFilterResult>;

    async fn bind(&self, binding: &Binding) -> Result<()>;
}

#[derive(Serialize)]
struct ExtenderArgs<'a> {
    pod: &'a Pod,
    nodenames: &'a [String],
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FilterResponse {
    #[serde(default, rename = "nodenames")]
    node_names: Option<Vec<String>>,
    #[serde(default)]
    failed_nodes: HashMap<String, String>,
    #[serde(default)]
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BindingArgs<'a> {
    pod_name: &'a str,
    pod_namespace: &'a str,
    #[serde(rename = "podUID")]
    pod_uid: &'a str,
    node: &'a str,
}

#[derive(Deserialize, Default)]
struct BindingResponse {
    #[serde(default)]
    error: String,
}

/// Extender reached over HTTP: POSTs JSON to `<urlPrefix>/<verb>`
pub struct HttpExtender {
    url_prefix: String,
    filter_verb: Option<String>,
    bind_verb: Option<String>,
    managed_resources: Vec<String>,
    ignorable: bool,
    client: Client,
}

impl HttpExtender {
    pub fn new(config: &ExtenderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| {
                SchedulerError::invalid_configuration(
                    format!("failed to build HTTP client for extender {}: {}", config.url_prefix, e),
                    "Check the extender's urlPrefix and httpTimeoutSeconds",
                )
            })?;

        Ok(Self {
            url_prefix: config.url_prefix.trim_end_matches('/').to_string(),
            filter_verb: config.filter_verb.clone(),
            bind_verb: config.bind_verb.clone(),
            managed_resources: config
                .managed_resources
                .iter()
                .map(|r| r.name.clone())
                .collect(),
            ignorable: config.ignorable,
            client,
        })
    }

    async fn post<T: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        phase: &str,
        verb: &str,
        body: &T,
    ) -> Result<R> {
        let url = format!("{}/{}", self.url_prefix, verb);
        debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.failed(phase, format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.failed(
                phase,
                format!("POST {} failed with status {}: {}", verb, status, body),
            ));
        }

        resp.json::<R>()
            .await
            .map_err(|e| self.failed(phase, format!("failed to parse {} response: {}", verb, e)))
    }

    fn failed(&self, phase: &str, message: String) -> SchedulerError {
        SchedulerError::extender_failed(phase, &self.url_prefix, message)
    }
}

/// Names of every resource requested or limited by any container of the pod
fn requested_resources(pod: &Pod) -> Vec<&str> {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Vec::new(),
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter_map(|c| c.resources.as_ref())
        .flat_map(|r| {
            r.requests
                .iter()
                .flatten()
                .chain(r.limits.iter().flatten())
                .map(|(name, _)| name.as_str())
        })
        .collect()
}

#[async_trait]
impl Extender for HttpExtender {
    fn name(&self) -> &str {
        &self.url_prefix
    }

    fn is_binder(&self) -> bool {
        self.bind_verb.is_some()
    }

    fn is_interested(&self, pod: &Pod) -> bool {
        if self.managed_resources.is_empty() {
            return true;
        }
        requested_resources(pod)
            .iter()
            .any(|name| self.managed_resources.iter().any(|m| m == name))
    }

    fn is_ignorable(&self) -> bool {
        self.ignorable
    }

    async fn filter(&self, pod: &Pod, node_names: &[String]) -> Result<ExtenderFilterResult> {
        let verb = match &self.filter_verb {
            Some(verb) => verb,
            None => {
                return Ok(ExtenderFilterResult {
                    node_names: node_names.to_vec(),
                    failed_nodes: HashMap::new(),
                })
            }
        };

        let response: FilterResponse = self
            .post("Filter", verb, &ExtenderArgs {
                pod,
                nodenames: node_names,
            })
            .await?;
        if !response.error.is_empty() {
            return Err(self.failed("Filter", response.error));
        }

        Ok(ExtenderFilterResult {
            node_names: response.node_names.unwrap_or_default(),
            failed_nodes: response.failed_nodes,
        })
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        let verb = self
            .bind_verb
            .as_ref()
            .ok_or_else(|| self.failed("Bind", "extender does not support binding".to_string()))?;

        let args = BindingArgs {
            pod_name: binding.metadata.name.as_deref().unwrap_or(""),
            pod_namespace: binding.metadata.namespace.as_deref().unwrap_or(""),
            pod_uid: binding.metadata.uid.as_deref().unwrap_or(""),
            node: binding.target.name.as_deref().unwrap_or(""),
        };
        let response: BindingResponse = self.post("Bind", verb, &args).await?;
        if !response.error.is_empty() {
            return Err(self.failed("Bind", response.error));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagedResource;
    use crate::test_util::{create_test_pod, with_requests};
    use crate::types::new_binding;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ExtenderConfig {
        ExtenderConfig {
            url_prefix: format!("{}/scheduler", url),
            filter_verb: Some("filter".to_string()),
            bind_verb: Some("bind".to_string()),
            weight: 1,
            http_timeout_seconds: 5,
            managed_resources: Vec::new(),
            ignorable: false,
        }
    }

    #[tokio::test]
    async fn test_filter_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scheduler/filter"))
            .and(body_partial_json(json!({"nodenames": ["machine1", "machine2"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodenames": ["machine2"],
                "failedNodes": {"machine1": "no GPU"}
            })))
            .mount(&server)
            .await;

        let extender = HttpExtender::new(&config(&server.uri())).unwrap();
        let pod = create_test_pod("foo", "default");
        let nodes = vec!["machine1".to_string(), "machine2".to_string()];

        let result = extender.filter(&pod, &nodes).await.unwrap();
        assert_eq!(result.node_names, vec!["machine2"]);
        assert_eq!(result.failed_nodes["machine1"], "no GPU");
    }

    #[tokio::test]
    async fn test_filter_error_field_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scheduler/filter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "overloaded"})))
            .mount(&server)
            .await;

        let extender = HttpExtender::new(&config(&server.uri())).unwrap();
        let err = extender
            .filter(&create_test_pod("foo", "default"), &["machine1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ExtenderFailed { .. }));
        assert_eq!(
            err.to_string(),
            format!(r#"running Filter extender "{}/scheduler": overloaded"#, server.uri())
        );
    }

    #[tokio::test]
    async fn test_bind_posts_binding_args() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scheduler/bind"))
            .and(body_partial_json(json!({
                "podName": "foo",
                "podNamespace": "default",
                "podUID": "foo-uid",
                "node": "machine1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let extender = HttpExtender::new(&config(&server.uri())).unwrap();
        assert!(extender.is_binder());
        let pod = create_test_pod("foo", "default");
        extender.bind(&new_binding(&pod, "machine1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let extender = HttpExtender::new(&config(&server.uri())).unwrap();
        let pod = create_test_pod("foo", "default");
        let err = extender.bind(&new_binding(&pod, "machine1")).await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().starts_with("running Bind extender"));
    }

    #[tokio::test]
    async fn test_bind_error_field_is_phase_qualified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scheduler/bind"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "node is full"})))
            .mount(&server)
            .await;

        let extender = HttpExtender::new(&config(&server.uri())).unwrap();
        let pod = create_test_pod("foo", "default");
        let err = extender.bind(&new_binding(&pod, "machine1")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(r#"running Bind extender "{}/scheduler": node is full"#, server.uri())
        );
    }

    #[test]
    fn test_interest_by_managed_resources() {
        let mut cfg = config("http://127.0.0.1:1");
        cfg.managed_resources = vec![ManagedResource {
            name: "example.com/gpu".to_string(),
            ignored_by_scheduler: true,
        }];
        let extender = HttpExtender::new(&cfg).unwrap();

        let plain = with_requests(create_test_pod("foo", "default"), "1", "1Gi");
        assert!(!extender.is_interested(&plain));

        let mut gpu = plain.clone();
        gpu.spec.as_mut().unwrap().containers[0]
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert(
                "example.com/gpu".to_string(),
                k8s_openapi::apimachinery::pkg::api::resource::Quantity("1".to_string()),
            );
        assert!(extender.is_interested(&gpu));
    }

    #[tokio::test]
    async fn test_filter_without_verb_passes_everything() {
        let mut cfg = config("http://127.0.0.1:1");
        cfg.filter_verb = None;
        let extender = HttpExtender::new(&cfg).unwrap();

        let nodes = vec!["machine1".to_string()];
        let result = extender
            .filter(&create_test_pod("foo", "default"), &nodes)
            .await
            .unwrap();
        assert_eq!(result.node_names, nodes);
    }
}
