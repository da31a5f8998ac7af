use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Client;

use sonic_common::{
    model_label_key, parse_model_label_key, ControlError, LabelState, ServerTarget,
};

use super::{LabelApi, ModelService, ServerDirectory, ServiceApi};

const FIELD_MANAGER: &str = "sonic-controller";

fn kube_error(e: kube::Error) -> ControlError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ControlError::NotFound(resp.message),
        kube::Error::Api(resp) => ControlError::Rejected {
            status: resp.code,
            message: resp.message,
        },
        other => ControlError::Transport(other.to_string()),
    }
}

/// Discovers inference servers as running pods matching a label selector.
#[derive(Clone)]
pub struct KubePodDirectory {
    pods: Api<Pod>,
    selector: String,
}

impl KubePodDirectory {
    pub fn new(client: Client, namespace: &str, selector: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            selector: selector.to_string(),
        }
    }
}

#[async_trait]
impl ServerDirectory for KubePodDirectory {
    async fn list_servers(&self) -> Result<Vec<ServerTarget>, ControlError> {
        let lp = ListParams::default().labels(&self.selector);
        let pods = self.pods.list(&lp).await.map_err(kube_error)?;

        let mut servers: Vec<ServerTarget> = pods
            .items
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter_map(|pod| {
                let status = pod.status?;
                if status.phase.as_deref() != Some("Running") {
                    return None;
                }
                Some(ServerTarget {
                    server_id: pod.metadata.name?,
                    address: status.pod_ip?,
                })
            })
            .collect();
        servers.sort();
        Ok(servers)
    }
}

/// Model labels stored on the server pods themselves.
#[derive(Clone)]
pub struct KubeLabelApi {
    pods: Api<Pod>,
}

impl KubeLabelApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }

    async fn patch_label(&self, server_id: &str, key: &str, value: Option<&str>) -> Result<(), ControlError> {
        // merge patch: a null value deletes the label
        let patch = serde_json::json!({
            "metadata": { "labels": { key: value } }
        });
        self.pods
            .patch(server_id, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(kube_error)?;
        Ok(())
    }
}

#[async_trait]
impl LabelApi for KubeLabelApi {
    async fn set_model_label(
        &self,
        server_id: &str,
        model_id: &str,
        state: LabelState,
    ) -> Result<(), ControlError> {
        self.patch_label(server_id, &model_label_key(model_id), Some(state.as_str()))
            .await
    }

    async fn remove_model_label(&self, server_id: &str, model_id: &str) -> Result<(), ControlError> {
        match self.patch_label(server_id, &model_label_key(model_id), None).await {
            // pod gone, so is the label
            Err(ControlError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn model_labels(&self, server_id: &str) -> Result<BTreeMap<String, LabelState>, ControlError> {
        let pod = self.pods.get(server_id).await.map_err(kube_error)?;
        Ok(pod
            .metadata
            .labels
            .unwrap_or_default()
            .iter()
            .filter_map(|(key, value)| {
                let model_id = parse_model_label_key(key)?;
                let state = LabelState::parse(value)?;
                Some((model_id.to_string(), state))
            })
            .collect())
    }
}

/// Headless per-model services, written with server-side apply.
#[derive(Clone)]
pub struct KubeServiceApi {
    services: Api<Service>,
    namespace: String,
}

impl KubeServiceApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

fn service_object(namespace: &str, svc: &ModelService) -> Service {
    let port = |name: &str, port: u16| ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    let annotations = BTreeMap::from([
        ("meta.helm.sh/release-name".to_string(), svc.release_name.clone()),
        ("meta.helm.sh/release-namespace".to_string(), namespace.to_string()),
    ]);

    Service {
        metadata: ObjectMeta {
            name: Some(svc.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(svc.labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(svc.selector()),
            ports: Some(vec![
                port("http", svc.ports.http),
                port("grpc", svc.ports.grpc),
                port("metrics", svc.ports.metrics),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ServiceApi for KubeServiceApi {
    async fn ensure_service(&self, svc: &ModelService) -> Result<(), ControlError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let object = service_object(&self.namespace, svc);
        self.services
            .patch(&svc.name, &params, &Patch::Apply(&object))
            .await
            .map_err(kube_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;

    #[test]
    fn test_service_object_is_headless_and_selects_loaded_pods() {
        let svc = ModelService {
            name: "sonic-deepmet".into(),
            release_name: "sonic".into(),
            model_id: "deepmet".into(),
            labels: BTreeMap::from([("app.kubernetes.io/instance".to_string(), "sonic".to_string())]),
            ports: PortConfig::default(),
        };
        let object = service_object("physics", &svc);

        assert_eq!(object.metadata.name.as_deref(), Some("sonic-deepmet"));
        assert_eq!(object.metadata.namespace.as_deref(), Some("physics"));
        let annotations = object.metadata.annotations.unwrap();
        assert_eq!(annotations["meta.helm.sh/release-namespace"], "physics");

        let spec = object.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let selector = spec.selector.unwrap();
        assert_eq!(selector["model.deepmet"], "loaded");
        assert_eq!(selector["app.kubernetes.io/instance"], "sonic");
        let ports: Vec<(String, i32)> = spec
            .ports
            .unwrap()
            .into_iter()
            .map(|p| (p.name.unwrap_or_default(), p.port))
            .collect();
        assert_eq!(
            ports,
            vec![("http".to_string(), 8000), ("grpc".to_string(), 8001), ("metrics".to_string(), 8002)]
        );
    }
}
