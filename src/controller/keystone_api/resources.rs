//! # Rendered Resources
//!
//! Builders for every object a KeystoneAPI owns: the endpoint Services,
//! configuration secret, db-sync and bootstrap Jobs, the API Deployment,
//! the trust-flush CronJob and the bodies of the MariaDB and RabbitMQ
//! requests. Builders are pure; applying them is the stages' business.

use crate::constants::{
    CONFIG_HASH_ANNOTATION, JOB_HASH_LABEL, KEYSTONE_PUBLIC_PORT, NETWORKS_ANNOTATION,
    SERVICE_LABEL, SERVICE_NAME,
};
use crate::crd::{Endpoint, KeystoneAPI};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    HTTPGetAction, KeyToPath, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, Probe,
    Secret, SecretKeySelector, SecretVolumeSource, SecurityContext, Service, ServicePort,
    ServiceSpec, TopologySpreadConstraint, Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use zeroize::Zeroizing;

const CONFIG_VOLUME: &str = "config-data";
const FERNET_VOLUME: &str = "fernet-keys";
const KOLLA_CONFIG_PATH: &str = "/var/lib/kolla/config_files/config.json";
const MERGED_CONFIG_PATH: &str = "/var/lib/config-data/merged";
const FERNET_KEY_REPOSITORY: &str = "/etc/keystone/fernet-keys";
const TLS_CERT_DIR: &str = "/var/lib/config-data/tls";

/// Database connection details gathered by the database stage
#[derive(Debug, Clone)]
pub struct DatabaseAccess {
    pub hostname: String,
    pub username: String,
    pub password: Zeroizing<String>,
}

/// Pod placement read from the referenced Topology
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub spread: Vec<TopologySpreadConstraint>,
    pub affinity: Option<Affinity>,
}

/// Values collected by earlier stages that later builders need
#[derive(Debug, Clone, Default)]
pub struct RenderInputs {
    pub database: Option<DatabaseAccess>,
    pub transport_url: Option<Zeroizing<String>>,
    pub memcached_servers: Vec<String>,
    /// `httpd_custom_*` fragments from the httpd customization secret
    pub httpd_fragments: BTreeMap<String, String>,
    pub federation_hash: Option<String>,
    pub tls_hash: Option<String>,
    pub fernet_hash: Option<String>,
    pub placement: Option<Placement>,
    pub networks: Vec<String>,
}

fn instance_name(api: &KeystoneAPI) -> String {
    api.metadata.name.clone().unwrap_or_default()
}

fn namespace(api: &KeystoneAPI) -> String {
    api.metadata.namespace.clone().unwrap_or_default()
}

pub fn config_secret_name(api: &KeystoneAPI) -> String {
    format!("{}-config-data", instance_name(api))
}

pub fn db_sync_job_name(api: &KeystoneAPI) -> String {
    format!("{}-db-sync", instance_name(api))
}

pub fn bootstrap_job_name(api: &KeystoneAPI) -> String {
    format!("{}-bootstrap", instance_name(api))
}

pub fn cron_job_name(api: &KeystoneAPI) -> String {
    format!("{}-cron", instance_name(api))
}

pub fn transport_url_name(api: &KeystoneAPI) -> String {
    format!("{}-keystone-transport", instance_name(api))
}

pub fn account_secret_name(account: &str) -> String {
    format!("{}-db-secret", account)
}

/// Labels shared by every object and pod of one KeystoneAPI
pub fn service_labels(api: &KeystoneAPI) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SERVICE_LABEL.to_string(), SERVICE_NAME.to_string()),
        ("owner".to_string(), instance_name(api)),
    ])
}

fn owner_references(api: &KeystoneAPI) -> Option<Vec<OwnerReference>> {
    api.controller_owner_ref(&()).map(|r| vec![r])
}

fn owned_meta(api: &KeystoneAPI, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace(api)),
        labels: Some(service_labels(api)),
        owner_references: owner_references(api),
        ..ObjectMeta::default()
    }
}

/// URL an endpoint is reachable on
///
/// The override's `endpointURL` wins; otherwise the cluster-local Service
/// address, over https when the endpoint has a certificate.
pub fn endpoint_url(api: &KeystoneAPI, endpoint: Endpoint) -> String {
    if let Some(url) = api
        .spec
        .override_
        .for_endpoint(endpoint)
        .and_then(|o| o.endpoint_url.clone())
    {
        return url;
    }
    let scheme = if api.tls_secret(endpoint).is_some() {
        "https"
    } else {
        "http"
    };
    format!(
        "{}://{}.{}.svc:{}",
        scheme,
        endpoint.service_name(),
        namespace(api),
        KEYSTONE_PUBLIC_PORT
    )
}

pub fn endpoint_service(api: &KeystoneAPI, endpoint: Endpoint) -> Service {
    let service_override = api
        .spec
        .override_
        .for_endpoint(endpoint)
        .cloned()
        .unwrap_or_default();
    let mut labels = service_labels(api);
    labels.insert("endpoint".to_string(), endpoint.as_str().to_string());
    labels.extend(service_override.labels());
    let annotations = service_override.annotations();

    Service {
        metadata: ObjectMeta {
            annotations: (!annotations.is_empty()).then_some(annotations),
            labels: Some(labels),
            ..owned_meta(api, endpoint.service_name())
        },
        spec: Some(ServiceSpec {
            type_: Some(service_override.service_type().as_str().to_string()),
            selector: Some(service_labels(api)),
            ports: Some(vec![ServicePort {
                name: Some(format!("keystone-{}", endpoint.as_str())),
                port: KEYSTONE_PUBLIC_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(KEYSTONE_PUBLIC_PORT)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Contents of the `{name}-config-data` secret
///
/// Entries of `defaultConfigOverwrite` replace generated files of the same name.
pub fn config_data(api: &KeystoneAPI, inputs: &RenderInputs) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    files.insert("keystone.conf".to_string(), keystone_conf(api, inputs));
    files.insert(
        "custom.conf".to_string(),
        api.spec.custom_service_config.clone(),
    );
    files.insert("my.cnf".to_string(), "[client]\nssl=0\n".to_string());
    files.insert("httpd.conf".to_string(), httpd_conf(api, inputs));
    files.insert("config.json".to_string(), kolla_config().to_string());
    for (name, fragment) in &inputs.httpd_fragments {
        files.insert(name.clone(), fragment.clone());
    }
    for (name, content) in &api.spec.default_config_overwrite {
        files.insert(name.clone(), content.clone());
    }
    files
}

fn keystone_conf(api: &KeystoneAPI, inputs: &RenderInputs) -> String {
    let mut conf = String::new();
    let _ = writeln!(conf, "[DEFAULT]\nuse_stderr = true");
    if let Some(url) = inputs.transport_url.as_ref() {
        let _ = writeln!(conf, "transport_url = {}", url.as_str());
    }

    if !inputs.memcached_servers.is_empty() {
        let _ = writeln!(
            conf,
            "\n[cache]\nenabled = true\nbackend = dogpile.cache.pymemcache\nmemcache_servers = {}",
            inputs.memcached_servers.join(",")
        );
    }

    if let Some(db) = inputs.database.as_ref() {
        let _ = writeln!(
            conf,
            "\n[database]\nconnection = mysql+pymysql://{}:{}@{}/{}?read_default_file=/etc/my.cnf\nmax_retries = -1\ndb_max_retries = -1",
            db.username,
            db.password.as_str(),
            db.hostname,
            SERVICE_NAME
        );
    }

    let _ = writeln!(
        conf,
        "\n[fernet_tokens]\nkey_repository = {}\nmax_active_keys = {}",
        FERNET_KEY_REPOSITORY, api.spec.fernet_max_active_keys
    );

    let driver = if inputs.transport_url.is_some() {
        "messagingv2"
    } else {
        "noop"
    };
    let _ = writeln!(conf, "\n[oslo_messaging_notifications]\ndriver = {}", driver);

    let _ = writeln!(
        conf,
        "\n[oslo_policy]\nenforce_new_defaults = {0}\nenforce_scope = {0}",
        api.spec.enable_secure_rbac
    );

    if api.spec.federated_realm_config.is_some() {
        let _ = writeln!(
            conf,
            "\n[identity]\ndomain_specific_drivers_enabled = true\ndomain_config_dir = {}",
            api.spec.federation_mount_path
        );
    }
    conf
}

fn httpd_conf(api: &KeystoneAPI, inputs: &RenderInputs) -> String {
    let mut conf = format!(
        "ServerRoot \"/etc/httpd\"\nListen {}\nTimeout {}\nInclude conf.modules.d/*.conf\n",
        KEYSTONE_PUBLIC_PORT, api.spec.api_timeout
    );
    for endpoint in Endpoint::ALL {
        let host = format!("{}.{}.svc", endpoint.service_name(), namespace(api));
        let _ = writeln!(conf, "\n<VirtualHost *:{}>", KEYSTONE_PUBLIC_PORT);
        let _ = writeln!(conf, "  ServerName {}", host);
        let _ = writeln!(
            conf,
            "  WSGIDaemonProcess {0} processes=3 threads=1 user=keystone group=keystone display-name={0}",
            endpoint.as_str()
        );
        let _ = writeln!(conf, "  WSGIProcessGroup {}", endpoint.as_str());
        let _ = writeln!(conf, "  WSGIScriptAlias / /usr/bin/keystone-wsgi-public");
        if api.tls_secret(endpoint).is_some() {
            let _ = writeln!(conf, "  SSLEngine on");
            let _ = writeln!(
                conf,
                "  SSLCertificateFile {0}/{1}.crt\n  SSLCertificateKeyFile {0}/{1}.key",
                TLS_CERT_DIR,
                endpoint.as_str()
            );
        }
        for fragment in inputs.httpd_fragments.keys() {
            let _ = writeln!(conf, "  Include conf/{}", fragment);
        }
        let _ = writeln!(conf, "</VirtualHost>");
    }
    conf
}

fn kolla_config() -> Value {
    json!({
        "command": "/usr/sbin/httpd -DFOREGROUND",
        "config_files": [
            {"source": format!("{}/keystone.conf", MERGED_CONFIG_PATH), "dest": "/etc/keystone/keystone.conf", "owner": "keystone", "perm": "0600"},
            {"source": format!("{}/custom.conf", MERGED_CONFIG_PATH), "dest": "/etc/keystone/keystone.conf.d/custom.conf", "owner": "keystone", "perm": "0600"},
            {"source": format!("{}/my.cnf", MERGED_CONFIG_PATH), "dest": "/etc/my.cnf", "owner": "keystone", "perm": "0644"},
            {"source": format!("{}/httpd.conf", MERGED_CONFIG_PATH), "dest": "/etc/httpd/conf/httpd.conf", "owner": "apache", "perm": "0644"},
            {"source": format!("{}/httpd_custom_*", MERGED_CONFIG_PATH), "dest": "/etc/httpd/conf/", "owner": "apache", "perm": "0444", "optional": true}
        ]
    })
}

pub fn config_secret(api: &KeystoneAPI, files: &BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: owned_meta(api, config_secret_name(api)),
        data: Some(
            files
                .iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

fn config_volumes(api: &KeystoneAPI) -> Vec<Volume> {
    let keys = usize::try_from(
        api.spec
            .fernet_max_active_keys
            .max(crate::constants::MIN_FERNET_KEYS),
    )
    .unwrap_or_default();
    vec![
        Volume {
            name: CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(config_secret_name(api)),
                default_mode: Some(0o640),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: FERNET_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(instance_name(api)),
                items: Some(fernet_key_items(keys)),
                default_mode: Some(0o400),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
    ]
}

/// Map `FernetKeys{i}` onto repository file names
///
/// keystone signs with the highest-numbered file, so the primary (index 0)
/// becomes file `N-1` and the oldest key file `0`.
pub fn fernet_key_items(keys: usize) -> Vec<KeyToPath> {
    (0..keys)
        .map(|i| KeyToPath {
            key: format!("{}{}", crate::constants::FERNET_KEY_PREFIX, i),
            path: (keys - 1 - i).to_string(),
            ..KeyToPath::default()
        })
        .collect()
}

fn config_mounts() -> Vec<VolumeMount> {
    let sub = |file: &str, path: &str| VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: path.to_string(),
        sub_path: Some(file.to_string()),
        read_only: Some(true),
        ..VolumeMount::default()
    };
    vec![
        sub("keystone.conf", "/etc/keystone/keystone.conf"),
        sub("custom.conf", "/etc/keystone/keystone.conf.d/custom.conf"),
        sub("my.cnf", "/etc/my.cnf"),
        VolumeMount {
            name: FERNET_VOLUME.to_string(),
            mount_path: FERNET_KEY_REPOSITORY.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    ]
}

fn admin_password_env(api: &KeystoneAPI) -> EnvVar {
    EnvVar {
        name: "OS_BOOTSTRAP_PASSWORD".to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: api.spec.secret.clone(),
                key: api.spec.password_selectors.admin.clone(),
                optional: Some(false),
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn keystone_container(api: &KeystoneAPI, name: &str, args: Vec<String>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(api.spec.container_image.clone()),
        command: Some(vec!["/bin/bash".to_string()]),
        args: Some(args),
        env: Some(vec![env("KOLLA_CONFIG_STRATEGY", "COPY_ALWAYS")]),
        volume_mounts: Some(config_mounts()),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..SecurityContext::default()
        }),
        ..Container::default()
    }
}

fn job(api: &KeystoneAPI, name: String, hash: &str, container: Container) -> Job {
    let mut labels = service_labels(api);
    labels.insert(JOB_HASH_LABEL.to_string(), hash.to_string());
    Job {
        metadata: ObjectMeta {
            labels: Some(labels),
            ..owned_meta(api, name)
        },
        spec: Some(JobSpec {
            backoff_limit: Some(6),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(service_labels(api)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".to_string()),
                    service_account_name: Some(format!("keystone-{}", instance_name(api))),
                    node_selector: api.effective_node_selector(),
                    containers: vec![container],
                    volumes: Some(config_volumes(api)),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// `keystone-manage db_sync`, rerun whenever `hash` changes
pub fn db_sync_job(api: &KeystoneAPI, hash: &str) -> Job {
    let container = keystone_container(
        api,
        "keystone-db-sync",
        vec!["-c".to_string(), "keystone-manage db_sync".to_string()],
    );
    job(api, db_sync_job_name(api), hash, container)
}

/// `keystone-manage bootstrap` registering the admin user and keystone's own endpoints
pub fn bootstrap_job(api: &KeystoneAPI, hash: &str) -> Job {
    let mut container = keystone_container(
        api,
        "keystone-bootstrap",
        vec!["-c".to_string(), "keystone-manage bootstrap".to_string()],
    );
    let mut vars = vec![
        env("OS_BOOTSTRAP_USERNAME", api.spec.admin_user.clone()),
        env("OS_BOOTSTRAP_PROJECT_NAME", api.spec.admin_project.clone()),
        env("OS_BOOTSTRAP_SERVICE_NAME", SERVICE_NAME),
        env("OS_BOOTSTRAP_REGION_ID", api.spec.region.clone()),
        env("OS_BOOTSTRAP_PUBLIC_URL", endpoint_url(api, Endpoint::Public)),
        env("OS_BOOTSTRAP_INTERNAL_URL", endpoint_url(api, Endpoint::Internal)),
        env("OS_BOOTSTRAP_ADMIN_URL", endpoint_url(api, Endpoint::Internal)),
        admin_password_env(api),
    ];
    if let Some(existing) = container.env.take() {
        vars.extend(existing);
    }
    container.env = Some(vars);
    job(api, bootstrap_job_name(api), hash, container)
}

fn default_affinity(api: &KeystoneAPI) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(service_labels(api)),
                            ..LabelSelector::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..PodAffinityTerm::default()
                    },
                },
            ]),
            ..PodAntiAffinity::default()
        }),
        ..Affinity::default()
    }
}

fn api_volumes(api: &KeystoneAPI) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = config_volumes(api);
    let mut mounts = vec![
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: MERGED_CONFIG_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: KOLLA_CONFIG_PATH.to_string(),
            sub_path: Some("config.json".to_string()),
            read_only: Some(true),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: FERNET_VOLUME.to_string(),
            mount_path: FERNET_KEY_REPOSITORY.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    ];

    for endpoint in Endpoint::ALL {
        if let Some(secret) = api.tls_secret(endpoint) {
            let volume = format!("{}-tls-certs", endpoint.as_str());
            volumes.push(Volume {
                name: volume.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    items: Some(vec![
                        KeyToPath {
                            key: "tls.crt".to_string(),
                            path: format!("{}.crt", endpoint.as_str()),
                            ..KeyToPath::default()
                        },
                        KeyToPath {
                            key: "tls.key".to_string(),
                            path: format!("{}.key", endpoint.as_str()),
                            ..KeyToPath::default()
                        },
                    ]),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            });
            mounts.push(VolumeMount {
                name: volume,
                mount_path: format!("{}/{}", TLS_CERT_DIR, endpoint.as_str()),
                read_only: Some(true),
                ..VolumeMount::default()
            });
        }
    }
    if let Some(bundle) = api
        .spec
        .tls
        .as_ref()
        .and_then(|t| t.ca_bundle_secret_name.clone())
    {
        volumes.push(Volume {
            name: "combined-ca-bundle".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(bundle),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "combined-ca-bundle".to_string(),
            mount_path: "/etc/pki/ca-trust/extracted/pem".to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    if let Some(realms) = api.spec.federated_realm_config.clone() {
        volumes.push(Volume {
            name: "federation-realms".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(realms),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "federation-realms".to_string(),
            mount_path: api.spec.federation_mount_path.clone(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    for extra in &api.spec.extra_mounts {
        volumes.push(Volume {
            name: extra.name.clone(),
            secret: extra.secret.clone().map(|name| SecretVolumeSource {
                secret_name: Some(name),
                ..SecretVolumeSource::default()
            }),
            config_map: extra.config_map.clone().map(|name| ConfigMapVolumeSource {
                name,
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: extra.name.clone(),
            mount_path: extra.mount_path.clone(),
            read_only: Some(extra.read_only),
            ..VolumeMount::default()
        });
    }
    (volumes, mounts)
}

fn http_probe(api: &KeystoneAPI, initial_delay: i32) -> Probe {
    let scheme = if api.tls_secret(Endpoint::Internal).is_some() {
        "HTTPS"
    } else {
        "HTTP"
    };
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/v3".to_string()),
            port: IntOrString::Int(KEYSTONE_PUBLIC_PORT),
            scheme: Some(scheme.to_string()),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(30),
        timeout_seconds: Some(30),
        ..Probe::default()
    }
}

/// The keystone API Deployment; `config_hash` rolls the pods when any input changes
pub fn deployment(api: &KeystoneAPI, inputs: &RenderInputs, config_hash: &str) -> Deployment {
    let (volumes, mounts) = api_volumes(api);
    let mut annotations = BTreeMap::from([(
        CONFIG_HASH_ANNOTATION.to_string(),
        config_hash.to_string(),
    )]);
    if !inputs.networks.is_empty() {
        let networks: Vec<Value> = inputs
            .networks
            .iter()
            .map(|name| json!({"name": name, "namespace": namespace(api)}))
            .collect();
        annotations.insert(
            NETWORKS_ANNOTATION.to_string(),
            Value::Array(networks).to_string(),
        );
    }

    let placement = inputs.placement.clone().unwrap_or_default();
    let container = Container {
        name: "keystone-api".to_string(),
        image: Some(api.spec.container_image.clone()),
        command: Some(vec!["/bin/bash".to_string()]),
        args: Some(vec!["-c".to_string(), "/usr/local/bin/kolla_start".to_string()]),
        env: Some(vec![env("KOLLA_CONFIG_STRATEGY", "COPY_ALWAYS")]),
        ports: Some(vec![ContainerPort {
            container_port: KEYSTONE_PUBLIC_PORT,
            name: Some("keystone".to_string()),
            ..ContainerPort::default()
        }]),
        volume_mounts: Some(mounts),
        liveness_probe: Some(http_probe(api, 5)),
        readiness_probe: Some(http_probe(api, 5)),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..SecurityContext::default()
        }),
        ..Container::default()
    };

    Deployment {
        metadata: owned_meta(api, instance_name(api)),
        spec: Some(DeploymentSpec {
            replicas: Some(api.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(service_labels(api)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(service_labels(api)),
                    annotations: Some(annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(format!("keystone-{}", instance_name(api))),
                    node_selector: api.effective_node_selector(),
                    affinity: Some(placement.affinity.unwrap_or_else(|| default_affinity(api))),
                    topology_spread_constraints: (!placement.spread.is_empty())
                        .then_some(placement.spread),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Periodic `keystone-manage trust_flush`
pub fn trust_flush_cron_job(api: &KeystoneAPI) -> CronJob {
    let command = format!("keystone-manage trust_flush {}", api.spec.trust_flush_args)
        .trim_end()
        .to_string();
    let mut container = keystone_container(
        api,
        "keystone-cron",
        vec!["-c".to_string(), command],
    );
    container.security_context = None;
    CronJob {
        metadata: owned_meta(api, cron_job_name(api)),
        spec: Some(CronJobSpec {
            schedule: api.spec.trust_flush_schedule.clone(),
            suspend: Some(api.spec.trust_flush_suspend),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    parallelism: Some(1),
                    completions: Some(1),
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".to_string()),
                            service_account_name: Some(format!(
                                "keystone-{}",
                                instance_name(api)
                            )),
                            node_selector: api.effective_node_selector(),
                            containers: vec![container],
                            volumes: Some(config_volumes(api)),
                            ..PodSpec::default()
                        }),
                    },
                    ..JobSpec::default()
                }),
            },
            ..CronJobSpec::default()
        }),
        ..CronJob::default()
    }
}

fn owner_refs_value(api: &KeystoneAPI) -> Value {
    serde_json::to_value(owner_references(api).unwrap_or_default()).unwrap_or(Value::Null)
}

/// MariaDBDatabase request for keystone's schema on `databaseInstance`
pub fn database_body(api: &KeystoneAPI) -> Value {
    json!({
        "apiVersion": "mariadb.openstack.org/v1beta1",
        "kind": "MariaDBDatabase",
        "metadata": {
            "name": instance_name(api),
            "namespace": namespace(api),
            "labels": { "dbName": api.spec.database_instance },
            "ownerReferences": owner_refs_value(api),
        },
        "spec": {
            "name": SERVICE_NAME,
            "defaultCharacterSet": "utf8",
            "defaultCollation": "utf8_general_ci",
        }
    })
}

/// MariaDBAccount created when the referenced account does not exist yet
pub fn account_body(api: &KeystoneAPI) -> Value {
    let account = &api.spec.database_account;
    json!({
        "apiVersion": "mariadb.openstack.org/v1beta1",
        "kind": "MariaDBAccount",
        "metadata": {
            "name": account,
            "namespace": namespace(api),
            "labels": { "mariaDBDatabaseName": instance_name(api) },
        },
        "spec": {
            "userName": account.replace('-', "_"),
            "secret": account_secret_name(account),
            "requireTLS": false,
        }
    })
}

/// Password secret backing a freshly created MariaDBAccount
pub fn account_secret(api: &KeystoneAPI, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(account_secret_name(&api.spec.database_account)),
            namespace: Some(namespace(api)),
            labels: Some(service_labels(api)),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            "DatabasePassword".to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

pub fn transport_url_body(api: &KeystoneAPI) -> Value {
    json!({
        "apiVersion": "rabbitmq.openstack.org/v1beta1",
        "kind": "TransportURL",
        "metadata": {
            "name": transport_url_name(api),
            "namespace": namespace(api),
            "ownerReferences": owner_refs_value(api),
        },
        "spec": { "rabbitmqClusterName": api.spec.rabbit_mq_cluster_name }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KeystoneAPISpec, ServiceOverride, TlsSecretRef};

    fn api() -> KeystoneAPI {
        let spec: KeystoneAPISpec = serde_json::from_value(json!({
            "databaseInstance": "openstack",
            "containerImage": "keystone:latest"
        }))
        .unwrap();
        let mut api = KeystoneAPI::new("keystone", spec);
        api.metadata.namespace = Some("openstack".to_string());
        api.metadata.uid = Some("uid-1".to_string());
        api
    }

    #[test]
    fn test_endpoint_url_defaults_to_cluster_service() {
        let api = api();
        assert_eq!(
            endpoint_url(&api, Endpoint::Internal),
            "http://keystone-internal.openstack.svc:5000"
        );
    }

    #[test]
    fn test_endpoint_url_uses_tls_and_override() {
        let mut api = api();
        let mut tls = crate::crd::ApiTlsSpec::default();
        tls.api.insert(
            Endpoint::Internal,
            TlsSecretRef {
                secret_name: "cert-internal".to_string(),
            },
        );
        api.spec.tls = Some(tls);
        api.spec.override_.service.insert(
            Endpoint::Public,
            ServiceOverride {
                endpoint_url: Some("https://keystone.example.com".to_string()),
                ..ServiceOverride::default()
            },
        );
        assert_eq!(
            endpoint_url(&api, Endpoint::Internal),
            "https://keystone-internal.openstack.svc:5000"
        );
        assert_eq!(
            endpoint_url(&api, Endpoint::Public),
            "https://keystone.example.com"
        );
    }

    #[test]
    fn test_fernet_items_put_primary_last() {
        let items = fernet_key_items(3);
        let mapping: Vec<(&str, &str)> = items
            .iter()
            .map(|i| (i.key.as_str(), i.path.as_str()))
            .collect();
        assert_eq!(
            mapping,
            [("FernetKeys0", "2"), ("FernetKeys1", "1"), ("FernetKeys2", "0")]
        );
    }

    #[test]
    fn test_empty_node_selector_is_not_rendered() {
        let mut api = api();
        api.spec.node_selector = Some(BTreeMap::new());
        let deployment = deployment(&api, &RenderInputs::default(), "h");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod.node_selector.is_none());

        api.spec.node_selector = Some(BTreeMap::from([("role".to_string(), "ctl".to_string())]));
        let job = db_sync_job(&api, "h");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap().get("role").map(String::as_str), Some("ctl"));
    }

    #[test]
    fn test_config_overwrite_replaces_generated_file() {
        let mut api = api();
        api.spec
            .default_config_overwrite
            .insert("my.cnf".to_string(), "[client]\nssl=1\n".to_string());
        let files = config_data(&api, &RenderInputs::default());
        assert_eq!(files.get("my.cnf").map(String::as_str), Some("[client]\nssl=1\n"));
        assert!(files["keystone.conf"].contains("max_active_keys = 5"));
    }

    #[test]
    fn test_service_override_shapes_service() {
        let mut api = api();
        api.spec.override_.service.insert(
            Endpoint::Public,
            serde_json::from_value(json!({
                "metadata": {"annotations": {"lb": "pool"}},
                "spec": {"type": "LoadBalancer"}
            }))
            .unwrap(),
        );
        let service = endpoint_service(&api, Endpoint::Public);
        assert_eq!(service.metadata.name.as_deref(), Some("keystone-public"));
        assert_eq!(
            service.spec.unwrap().type_.as_deref(),
            Some("LoadBalancer")
        );
        assert_eq!(
            service.metadata.annotations.unwrap().get("lb").map(String::as_str),
            Some("pool")
        );
    }
}
