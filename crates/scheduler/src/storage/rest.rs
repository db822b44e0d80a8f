use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Credentials, ObjectRef, SdsSpec, StorageBackend, StorageError, StorageSession};

/// ScaleIO gateway REST client.
#[derive(Debug, Clone)]
pub struct RestStorageBackend {
    client: Client,
}

impl RestStorageBackend {
    /// Gateways ship with self-signed certificates.
    pub fn new() -> Result<Self, StorageError> {
        let client = Client::builder().danger_accept_invalid_certs(true).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StorageBackend for RestStorageBackend {
    type Session = RestSession;

    async fn authenticate(
        &self,
        endpoint: &str,
        api_version: &str,
        credentials: &Credentials,
    ) -> Result<RestSession, StorageError> {
        let base_url = endpoint.trim_end_matches('/').to_string();
        debug!(endpoint = %base_url, "logging in to ScaleIO gateway");

        let response = self
            .client
            .get(format!("{base_url}/login"))
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(StorageError::Auth(format!("{status} from {base_url}/login")));
        }

        // Token wird als JSON-String geliefert
        let token: String = response.json().await?;

        Ok(RestSession {
            client: self.client.clone(),
            base_url,
            api_version: api_version.to_string(),
            username: credentials.username.clone(),
            token,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "deviceCurrentPathname")]
    device_current_path_name: Option<String>,
}

impl Instance {
    fn into_ref(self) -> ObjectRef {
        let name = self
            .name
            .or(self.device_current_path_name)
            .unwrap_or_default();
        ObjectRef { id: self.id, name }
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

/// Authenticated gateway session.
#[derive(Debug, Clone)]
pub struct RestSession {
    client: Client,
    base_url: String,
    api_version: String,
    username: String,
    token: String,
}

impl RestSession {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.token))
            .header(
                reqwest::header::ACCEPT,
                format!("application/json;version={}", self.api_version),
            )
    }

    async fn check(response: Response) -> Result<Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StorageError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<Instance>, StorageError> {
        let response = self.request(Method::GET, path).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn create(&self, kind: &str, body: Value, name: &str) -> Result<ObjectRef, StorageError> {
        let response = self
            .request(Method::POST, &format!("/types/{kind}/instances"))
            .json(&body)
            .send()
            .await?;
        let created: Created = Self::check(response).await?.json().await?;
        debug!(kind, name, id = %created.id, "created storage object");
        Ok(ObjectRef::new(created.id, name))
    }

    async fn action(&self, kind: &str, id: &str, action: &str) -> Result<(), StorageError> {
        let response = self
            .request(Method::POST, &format!("/instances/{kind}::{id}/action/{action}"))
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn find_related(&self, parent: &str, parent_id: &str, kind: &str, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        let instances = self
            .list(&format!("/instances/{parent}::{parent_id}/relationships/{kind}"))
            .await?;
        Ok(instances
            .into_iter()
            .map(Instance::into_ref)
            .find(|o| o.name == name))
    }
}

#[async_trait]
impl StorageSession for RestSession {
    async fn find_system(&self, id: &str, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        let systems: Vec<ObjectRef> = self
            .list("/types/System/instances")
            .await?
            .into_iter()
            .map(Instance::into_ref)
            .collect();

        if id.is_empty() && name.is_empty() {
            return Ok(match systems.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            });
        }

        Ok(systems
            .into_iter()
            .find(|s| (!id.is_empty() && s.id == id) || (!name.is_empty() && s.name == name)))
    }

    async fn find_protection_domain(&self, system: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.find_related("System", &system.id, "ProtectionDomain", name).await
    }

    async fn create_protection_domain(&self, _system: &ObjectRef, name: &str) -> Result<ObjectRef, StorageError> {
        self.create("ProtectionDomain", json!({ "name": name }), name).await
    }

    async fn remove_protection_domain(&self, domain: &ObjectRef) -> Result<(), StorageError> {
        self.action("ProtectionDomain", &domain.id, "removeProtectionDomain").await
    }

    async fn find_sds(&self, domain: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.find_related("ProtectionDomain", &domain.id, "Sds", name).await
    }

    async fn create_sds(&self, domain: &ObjectRef, spec: &SdsSpec) -> Result<ObjectRef, StorageError> {
        let role = spec.modes.first().map(String::as_str).unwrap_or("all");
        let ips: Vec<Value> = spec
            .ips
            .iter()
            .map(|ip| json!({ "SdsIp": { "ip": ip, "role": role } }))
            .collect();

        let mut body = json!({
            "name": spec.name,
            "protectionDomainId": domain.id,
            "sdsIpList": ips,
        });
        if let Some(fault_set) = &spec.fault_set {
            body["faultSetId"] = json!(fault_set);
        }

        self.create("Sds", body, &spec.name).await
    }

    async fn remove_sds(&self, sds: &ObjectRef) -> Result<(), StorageError> {
        self.action("Sds", &sds.id, "removeSds").await
    }

    async fn find_storage_pool(&self, domain: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.find_related("ProtectionDomain", &domain.id, "StoragePool", name).await
    }

    async fn create_storage_pool(&self, domain: &ObjectRef, name: &str) -> Result<ObjectRef, StorageError> {
        let body = json!({
            "name": name,
            "protectionDomainId": domain.id,
        });
        self.create("StoragePool", body, name).await
    }

    async fn remove_storage_pool(&self, pool: &ObjectRef) -> Result<(), StorageError> {
        self.action("StoragePool", &pool.id, "removeStoragePool").await
    }

    async fn find_device(&self, pool: &ObjectRef, path: &str) -> Result<Option<ObjectRef>, StorageError> {
        let devices = self
            .list(&format!("/instances/StoragePool::{}/relationships/Device", pool.id))
            .await?;
        Ok(devices
            .into_iter()
            .find(|d| d.device_current_path_name.as_deref() == Some(path))
            .map(|d| ObjectRef::new(d.id, path)))
    }

    async fn attach_device(&self, pool: &ObjectRef, path: &str, sds_id: &str) -> Result<ObjectRef, StorageError> {
        let body = json!({
            "deviceCurrentPathname": path,
            "storagePoolId": pool.id,
            "sdsId": sds_id,
        });
        self.create("Device", body, path).await
    }

    async fn detach_device(&self, device: &ObjectRef) -> Result<(), StorageError> {
        self.action("Device", &device.id, "removeDevice").await
    }
}
