use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig, NamedAuthInfo};

use logscope_types::{ContainerInfo, Credential, PodInfo};

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct KubeClient {
    kubeconfig: Kubeconfig,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    pub fn new() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;
        Ok(Self::from_kubeconfig(kubeconfig))
    }

    /// Wrap an already loaded kubeconfig
    pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Self {
        Self { kubeconfig }
    }

    /// Names of every context in the kubeconfig
    pub fn context_names(&self) -> Vec<String> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|ctx| ctx.name.clone())
            .collect()
    }

    /// Create a kube::Client for a context, authenticating with the given bearer token
    pub async fn client_for_context(
        &self,
        context_name: &str,
        credential: &Credential,
    ) -> Result<kube::Client> {
        let kubeconfig = self.kubeconfig_with_token(context_name, credential.token());

        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))
    }

    /// Create a copy of kubeconfig with token-based auth for the context's user
    fn kubeconfig_with_token(&self, context_name: &str, token: &str) -> Kubeconfig {
        let mut kubeconfig = self.kubeconfig.clone();

        let user_name = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .and_then(|c| c.context.as_ref())
            .and_then(|c| c.user.clone());

        let Some(user_name) = user_name else {
            return kubeconfig;
        };

        // Bearer token replaces any exec/cert auth the user had
        let auth = AuthInfo {
            token: Some(token.to_string().into()),
            ..Default::default()
        };

        if let Some(auth_info) = kubeconfig
            .auth_infos
            .iter_mut()
            .find(|a| a.name == user_name)
        {
            auth_info.auth_info = Some(auth);
        } else {
            kubeconfig.auth_infos.push(NamedAuthInfo {
                name: user_name,
                auth_info: Some(auth),
            });
        }

        kubeconfig
    }

    /// Fetch one pod with its containers
    pub async fn get_pod(
        &self,
        client: &kube::Client,
        namespace: &str,
        name: &str,
    ) -> Result<PodInfo> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let pod = pods.get(name).await.context(format!(
            "Failed to get pod '{}' in namespace '{}'",
            name, namespace
        ))?;

        Ok(Self::pod_to_info(pod, namespace))
    }

    /// Convert a k8s Pod to PodInfo, containers in spec order
    fn pod_to_info(pod: Pod, namespace: &str) -> PodInfo {
        let name = pod.metadata.name.unwrap_or_default();
        let mut info = PodInfo::new(name, namespace.to_string());

        if let Some(spec) = pod.spec {
            info.containers = spec
                .containers
                .into_iter()
                .map(|c| ContainerInfo::new(c.name))
                .collect();
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::config::{Context as KubeContext, NamedContext};

    fn kubeconfig() -> Kubeconfig {
        Kubeconfig {
            current_context: Some("dev".to_string()),
            contexts: vec![NamedContext {
                name: "dev".to_string(),
                context: Some(KubeContext {
                    cluster: "dev-cluster".to_string(),
                    user: Some("dev-user".to_string()),
                    namespace: Some("apps".to_string()),
                    ..Default::default()
                }),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_token_injected_for_missing_user() {
        let client = KubeClient::from_kubeconfig(kubeconfig());
        let patched = client.kubeconfig_with_token("dev", "abc");
        let auth = patched
            .auth_infos
            .iter()
            .find(|a| a.name == "dev-user")
            .and_then(|a| a.auth_info.as_ref());
        assert!(auth.is_some_and(|a| a.token.is_some()));
    }

    #[test]
    fn test_unknown_context_leaves_config_untouched() {
        let client = KubeClient::from_kubeconfig(kubeconfig());
        let patched = client.kubeconfig_with_token("prod", "abc");
        assert!(patched.auth_infos.is_empty());
    }

    #[test]
    fn test_context_names() {
        let client = KubeClient::from_kubeconfig(kubeconfig());
        assert_eq!(client.context_names(), vec!["dev".to_string()]);
    }

    #[test]
    fn test_pod_containers_in_spec_order() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("api-7d9f".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    Container {
                        name: "main".to_string(),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = KubeClient::pod_to_info(pod, "apps");
        assert_eq!(info.name, "api-7d9f");
        assert_eq!(info.namespace, "apps");
        assert_eq!(info.container_names(), vec!["main", "sidecar"]);
    }
}
