//! Ferry operator - live migration of virtual machine instances

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use ferry::config::{watch_config_map, ConfigPublisher, MigrationConfig, DEFAULT_CONFIG_MAP};
use ferry::controller::{
    error_policy, reconcile, reconcile_vmi, vmi_error_policy, Context, KubeMigrationClient,
    FIELD_MANAGER, MIGRATION_LABEL,
};
use ferry::crd::{VirtualMachineInstance, VirtualMachineInstanceMigration};
use ferry::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use ferry::transfer::DEFAULT_HANDLER_PORT;
use ferry::transport::MigrationCa;
use ferry::webhook::{webhook_router, WebhookState};
use ferry::{CA_SECRET_NAME, DEFAULT_NAMESPACE, DEFAULT_WEBHOOK_PORT, DEFAULT_WEBHOOK_SERVICE};

const CA_CERT_KEY: &str = "ca.crt";
const CA_KEY_KEY: &str = "ca.key";

/// Ferry - live-migration control plane for virtual machine instances
#[derive(Parser, Debug)]
#[command(name = "ferry", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line encoding
    #[arg(long, env = "FERRY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Serves the admission webhook and runs the migration and VMI
    /// controllers until interrupted.
    Controller,
}

/// Process-level settings for controller mode
#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Namespace the operator, its CA and the transfer handlers live in
    #[arg(long, env = "FERRY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// ConfigMap holding the migration configuration
    #[arg(long, env = "FERRY_CONFIG_MAP", default_value = DEFAULT_CONFIG_MAP)]
    config_map: String,

    /// Port the admission webhook listens on
    #[arg(long, env = "FERRY_WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// Service name the API server reaches the webhook through
    #[arg(long, env = "FERRY_WEBHOOK_SERVICE", default_value = DEFAULT_WEBHOOK_SERVICE)]
    webhook_service: String,

    /// Image run by target pods
    #[arg(long, env = "FERRY_TARGET_IMAGE")]
    target_image: Option<String>,

    /// Port of the node transfer handler API
    #[arg(long, env = "FERRY_HANDLER_PORT", default_value_t = DEFAULT_HANDLER_PORT)]
    handler_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             Session certificates cannot be checked without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let vmi = serde_yaml::to_string(&VirtualMachineInstance::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let migration = serde_yaml::to_string(&VirtualMachineInstanceMigration::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{vmi}---\n{migration}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        default_filter: None,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Ensure both Ferry CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [
        VirtualMachineInstance::crd(),
        VirtualMachineInstanceMigration::crd(),
    ] {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All Ferry CRDs installed/updated");
    Ok(())
}

/// Load the migration CA from its Secret, creating it on first start
async fn load_or_create_ca(client: &Client, namespace: &str) -> anyhow::Result<MigrationCa> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    if let Some(secret) = secrets.get_opt(CA_SECRET_NAME).await? {
        let data = secret.data.unwrap_or_default();
        let field = |key: &str| -> anyhow::Result<String> {
            let bytes = data
                .get(key)
                .ok_or_else(|| anyhow::anyhow!("CA secret is missing {}", key))?;
            String::from_utf8(bytes.0.clone())
                .map_err(|e| anyhow::anyhow!("Invalid {} encoding: {}", key, e))
        };
        let ca = MigrationCa::from_pem(&field(CA_CERT_KEY)?, &field(CA_KEY_KEY)?)?;
        tracing::info!(secret = CA_SECRET_NAME, "Loaded migration CA");
        return Ok(ca);
    }

    let ca = MigrationCa::new("ferry migration CA")?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(CA_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                CA_CERT_KEY.to_string(),
                ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
            ),
            (
                CA_KEY_KEY.to_string(),
                ByteString(ca.ca_key_pem().as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    };

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            tracing::info!(secret = CA_SECRET_NAME, "Created migration CA");
            Ok(ca)
        }
        // Lost a race with another replica; use theirs
        Err(kube::Error::Api(e)) if e.code == 409 => {
            Box::pin(load_or_create_ca(client, namespace)).await
        }
        Err(e) => Err(anyhow::anyhow!("Failed to store migration CA: {}", e)),
    }
}

/// Ensure the webhook Service and ValidatingWebhookConfiguration are installed
///
/// Two webhooks point at the same Service: one for migration requests and
/// one for pod evictions.
async fn ensure_webhook_config(
    client: &Client,
    args: &ControllerArgs,
    ca: &MigrationCa,
) -> anyhow::Result<()> {
    use k8s_openapi::api::admissionregistration::v1::{
        RuleWithOperations, ServiceReference, ValidatingWebhook,
        ValidatingWebhookConfiguration, WebhookClientConfig,
    };
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::{Patch, PatchParams};

    let params = PatchParams::apply(FIELD_MANAGER).force();

    // 1. ClusterIP Service in front of the operator's webhook port
    let webhook_service = Service {
        metadata: ObjectMeta {
            name: Some(args.webhook_service.clone()),
            namespace: Some(args.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                "ferry-controller".to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(i32::from(args.webhook_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let services: Api<Service> = Api::namespaced(client.clone(), &args.namespace);
    services
        .patch(&args.webhook_service, &params, &Patch::Apply(&webhook_service))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create webhook Service: {}", e))?;

    // 2. ValidatingWebhookConfiguration
    let ca_bundle = ByteString(ca.ca_cert_pem().as_bytes().to_vec());
    let webhook = |name: &str, path: &str, rule: RuleWithOperations| ValidatingWebhook {
        name: name.to_string(),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Fail".to_string()),
        match_policy: Some("Equivalent".to_string()),
        rules: Some(vec![rule]),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: args.webhook_service.clone(),
                namespace: args.namespace.clone(),
                path: Some(path.to_string()),
                port: Some(443),
            }),
            ca_bundle: Some(ca_bundle.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    let webhook_config = ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some("ferry-validator".to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![
            webhook(
                "migrations.ferry.dev",
                "/validate/migrations",
                RuleWithOperations {
                    operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                    api_groups: Some(vec!["ferry.dev".to_string()]),
                    api_versions: Some(vec!["v1alpha1".to_string()]),
                    resources: Some(vec!["virtualmachineinstancemigrations".to_string()]),
                    scope: Some("Namespaced".to_string()),
                },
            ),
            webhook(
                "evictions.ferry.dev",
                "/validate/evictions",
                RuleWithOperations {
                    operations: Some(vec!["CREATE".to_string()]),
                    api_groups: Some(vec![String::new()]),
                    api_versions: Some(vec!["v1".to_string()]),
                    resources: Some(vec!["pods/eviction".to_string()]),
                    scope: Some("Namespaced".to_string()),
                },
            ),
        ]),
    };

    let webhooks: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    webhooks
        .patch("ferry-validator", &params, &Patch::Apply(&webhook_config))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create ValidatingWebhookConfiguration: {}", e))?;

    tracing::info!("Webhook configuration installed");
    Ok(())
}

/// Serve the admission webhook over TLS with a CA-issued certificate
async fn start_webhook_server(
    args: &ControllerArgs,
    ca: &MigrationCa,
    state: WebhookState,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let service = format!("{}.{}.svc", args.webhook_service, args.namespace);
    let sans = vec![
        args.webhook_service.clone(),
        service.clone(),
        format!("{service}.cluster.local"),
    ];
    let cert = ca.issue_server_cert(&sans)?;

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(
        cert.cert_pem.as_bytes().to_vec(),
        cert.key_pem.as_bytes().to_vec(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to build webhook TLS config: {}", e))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.webhook_port));
    let router = webhook_router(Arc::new(state));

    tracing::info!(addr = %addr, "Starting admission webhook");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .serve(router.into_make_service())
            .await
        {
            tracing::error!(error = %e, "Webhook server error");
        }
    }))
}

/// Run in controller mode - drives migrations
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Ferry controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRDs on startup
    ensure_crds_installed(&client).await?;

    let ca = Arc::new(load_or_create_ca(&client, &args.namespace).await?);

    // Seed the configuration before anything is admitted
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &args.namespace);
    let initial = match config_maps.get_opt(&args.config_map).await {
        Ok(cm) => MigrationConfig::from_config_map(cm.as_ref()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid migration configuration, using defaults");
            MigrationConfig::default()
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read migration configuration, using defaults");
            MigrationConfig::default()
        }
    };
    let (publisher, config) = ConfigPublisher::new(initial);
    let config_watch = tokio::spawn(watch_config_map(
        client.clone(),
        args.namespace.clone(),
        args.config_map.clone(),
        publisher,
    ));

    let webhook_state = WebhookState::new(
        Arc::new(KubeMigrationClient::new(client.clone())),
        config.clone(),
    );
    let webhook_server = start_webhook_server(&args, &ca, webhook_state).await?;
    ensure_webhook_config(&client, &args, &ca).await?;

    let mut ctx_builder = Context::builder(client.clone(), ca.clone(), config)
        .namespace(args.namespace.clone())
        .handler_port(args.handler_port);
    if let Some(image) = args.target_image.clone() {
        ctx_builder = ctx_builder.target_image(image);
    }
    let ctx = Arc::new(ctx_builder.build()?);

    let migrations: Api<VirtualMachineInstanceMigration> = Api::all(client.clone());
    let vmis: Api<VirtualMachineInstance> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);

    tracing::info!("Starting Ferry controllers...");
    tracing::info!("  - VirtualMachineInstanceMigration controller");
    tracing::info!("  - VirtualMachineInstance controller");

    // Migrations react to their VMI and to their target pods
    let migration_controller = Controller::new(migrations.clone(), WatcherConfig::default());
    let migration_store = migration_controller.store();
    let migration_controller = migration_controller
        .watches(vmis.clone(), WatcherConfig::default(), move |vmi| {
            let namespace = vmi.namespace().unwrap_or_default();
            let name = vmi.name_any();
            migration_store
                .state()
                .into_iter()
                .filter(|m| m.targets(&namespace, &name))
                .map(|m| ObjectRef::from_obj(&*m))
                .collect::<Vec<_>>()
        })
        .watches(
            pods,
            WatcherConfig::default().labels(MIGRATION_LABEL),
            |pod| {
                let namespace = pod.namespace()?;
                let name = pod.labels().get(MIGRATION_LABEL)?.clone();
                Some(ObjectRef::<VirtualMachineInstanceMigration>::new(&name).within(&namespace))
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Migration reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Migration reconciliation error");
                }
            }
        });

    // VMIs react to their migrations and to drain taints on their node
    let vmi_controller = Controller::new(vmis, WatcherConfig::default());
    let vmi_store = vmi_controller.store();
    let vmi_controller = vmi_controller
        .watches(migrations, WatcherConfig::default(), |migration| {
            let namespace = migration.namespace()?;
            Some(
                ObjectRef::<VirtualMachineInstance>::new(&migration.spec.vmi_name)
                    .within(&namespace),
            )
        })
        .watches(nodes, WatcherConfig::default(), move |node| {
            let node_name = node.name_any();
            vmi_store
                .state()
                .into_iter()
                .filter(|vmi| vmi.node_name() == Some(node_name.as_str()))
                .map(|vmi| ObjectRef::from_obj(&*vmi))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile_vmi, vmi_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "VMI reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "VMI reconciliation error");
                }
            }
        });

    // Run both controllers concurrently
    tokio::select! {
        _ = migration_controller => {
            tracing::info!("Migration controller completed");
        }
        _ = vmi_controller => {
            tracing::info!("VMI controller completed");
        }
    }

    config_watch.abort();
    webhook_server.abort();

    tracing::info!("Ferry controller shutting down");
    Ok(())
}
