use std::collections::BTreeMap;
use std::sync::Arc;

use carto_core::conditions::RESOURCE_SUBMITTED;
use carto_core::{
    ClusterConfigTemplate, ClusterImageTemplate, ClusterSourceTemplate, ClusterSupplyChain, Condition, ConditionStatus,
    ConfigTemplateSpec, GitRef, GitSource, ImageTemplateSpec, Param, ResourceBinding, ResourceStatus, ResourceStatuses,
    SourceTemplateSpec, StampedRef, SupplyChainResource, SupplyChainSpec, Template, TemplateParam, TemplateRef, Workload,
    WorkloadSource, WorkloadSpec,
};
use carto_kubehub::{InMemoryRepository, Repository};
use carto_realizer::{RealizeError, Realizer, ResourceRealizer};
use carto_templates::JsonPathEvaluator;
use serde_json::json;

fn workload(repo: &InMemoryRepository) -> Workload {
    let mut w = Workload::new(
        "app",
        WorkloadSpec {
            source: Some(WorkloadSource {
                git: Some(GitSource {
                    url: "https://git.local/app".into(),
                    git_ref: Some(GitRef { branch: Some("main".into()), ..Default::default() }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    w.metadata.namespace = Some("w1".into());
    w.metadata.labels = Some(BTreeMap::from([("type".to_string(), "web".to_string())]));
    repo.put_workload(w.clone());
    repo.workload(&w.key()).unwrap()
}

fn entry(name: &str, kind: &str, template: &str) -> SupplyChainResource {
    SupplyChainResource { name: name.into(), template_ref: TemplateRef { kind: kind.into(), name: template.into() }, ..Default::default() }
}

fn chain(resources: Vec<SupplyChainResource>) -> ClusterSupplyChain {
    ClusterSupplyChain::new(
        "sc1",
        SupplyChainSpec {
            selector: BTreeMap::from([("type".to_string(), "web".to_string())]),
            params: vec![Param { name: "registry".into(), value: json!("registry.local") }],
            resources,
            ..Default::default()
        },
    )
}

fn build_chain() -> ClusterSupplyChain {
    let source = entry("source-provider", "ClusterSourceTemplate", "git-tpl");
    let mut image = entry("image-builder", "ClusterImageTemplate", "kpack-tpl");
    image.sources = vec![ResourceBinding { name: "src".into(), resource: "source-provider".into() }];
    let mut config = entry("app-config", "ClusterConfigTemplate", "cfg-tpl");
    config.images = vec![ResourceBinding { name: "built".into(), resource: "image-builder".into() }];
    config.params = vec![Param { name: "port".into(), value: json!(9090) }];
    // declared out of order on purpose
    chain(vec![config, image, source])
}

fn install_templates(repo: &InMemoryRepository) {
    repo.put_template(Template::Source(ClusterSourceTemplate::new(
        "git-tpl",
        SourceTemplateSpec {
            template: json!({
                "apiVersion": "source.toolkit.fluxcd.io/v1beta1",
                "kind": "GitRepository",
                "metadata": { "name": "$(workload.metadata.name)$-source" },
                "spec": { "url": "$(workload.spec.source.git.url)$", "ref": { "branch": "$(workload.spec.source.git.ref.branch)$" } }
            }),
            params: vec![],
            url_path: ".status.artifact.url".into(),
            revision_path: ".status.artifact.revision".into(),
        },
    )));
    repo.put_template(Template::Image(ClusterImageTemplate::new(
        "kpack-tpl",
        ImageTemplateSpec {
            template: json!({
                "apiVersion": "kpack.io/v1alpha2",
                "kind": "Image",
                "metadata": { "name": "$(workload.metadata.name)$-image" },
                "spec": { "tag": "$(params.registry)$/$(workload.metadata.name)$", "source": { "blob": { "url": "$(sources.src.url)$" } } }
            }),
            params: vec![],
            image_path: ".status.latestImage".into(),
        },
    )));
    repo.put_template(Template::Config(ClusterConfigTemplate::new(
        "cfg-tpl",
        ConfigTemplateSpec {
            template: json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "$(workload.metadata.name)$-config" },
                "data": { "image": "$(image)$", "port": "port=$(params.port)$" }
            }),
            params: vec![TemplateParam { name: "port".into(), default_value: json!(8080) }],
            config_path: ".data".into(),
        },
    )));
}

fn stamped(api_version: &str, kind: &str, name: &str) -> StampedRef {
    StampedRef { api_version: api_version.into(), kind: kind.into(), namespace: Some("w1".into()), name: name.into() }
}

fn condition<'a>(status: &'a ResourceStatus, type_: &str) -> &'a Condition {
    status.conditions.iter().find(|c| c.type_ == type_).unwrap()
}

fn by_name<'a>(statuses: &'a ResourceStatuses, name: &str) -> &'a ResourceStatus {
    statuses.current().iter().find(|s| s.name == name).unwrap()
}

#[tokio::test]
async fn outputs_flow_downstream_as_upstream_objects_become_ready() {
    let repo = Arc::new(InMemoryRepository::new());
    install_templates(&repo);
    let w = workload(&repo);
    let sc = build_chain();
    let rr = ResourceRealizer::new(repo.clone() as Arc<dyn Repository>, Arc::new(JsonPathEvaluator), &w, &sc).unwrap();
    let git = stamped("source.toolkit.fluxcd.io/v1beta1", "GitRepository", "app-source");
    let img = stamped("kpack.io/v1alpha2", "Image", "app-image");
    let cfg = stamped("v1", "ConfigMap", "app-config");

    // Pass 1: the GitRepository has no status yet.
    let mut statuses = ResourceStatuses::new(vec![]);
    let err = Realizer.realize(&rr, &sc, &mut statuses).await.unwrap_err();
    assert_eq!(err.expression(), Some(".status.artifact.url"));
    let names: Vec<_> = statuses.current().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["source-provider", "image-builder", "app-config"]);
    assert_eq!(by_name(&statuses, "source-provider").stamped_ref.as_ref(), Some(&git));
    assert_eq!(condition(by_name(&statuses, "source-provider"), RESOURCE_SUBMITTED).reason, "TemplateStampFailure");
    let skipped = by_name(&statuses, "app-config");
    assert!(skipped.stamped_ref.is_none());
    assert_eq!(condition(skipped, RESOURCE_SUBMITTED).reason, "TemplateInputsError");

    let live = repo.object(&git).unwrap();
    assert_eq!(live["spec"]["url"], json!("https://git.local/app"));
    assert_eq!(live["spec"]["ref"]["branch"], json!("main"));
    assert_eq!(live["metadata"]["labels"]["carto.run/resource-name"], json!("source-provider"));
    assert_eq!(live["metadata"]["labels"]["carto.run/cluster-supply-chain-name"], json!("sc1"));
    assert_eq!(live["metadata"]["labels"]["carto.run/template-kind"], json!("ClusterSourceTemplate"));
    assert_eq!(live["metadata"]["ownerReferences"][0]["name"], json!("app"));
    assert_eq!(live["metadata"]["ownerReferences"][0]["controller"], json!(true));

    // Pass 2: source is ready, image is not.
    repo.set_object_status(&git, json!({ "artifact": { "url": "http://src.local/app.tgz", "revision": "abc123" } }));
    let mut statuses = ResourceStatuses::new(statuses.current().to_vec());
    let err = Realizer.realize(&rr, &sc, &mut statuses).await.unwrap_err();
    assert!(matches!(err, RealizeError::JsonPath { ref resource, .. } if resource == "image-builder"));
    let image = repo.object(&img).unwrap();
    assert_eq!(image["spec"]["tag"], json!("registry.local/app"));
    assert_eq!(image["spec"]["source"]["blob"]["url"], json!("http://src.local/app.tgz"));
    let src = by_name(&statuses, "source-provider");
    let outputs: Vec<_> = src.outputs.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(outputs, vec!["url", "revision"]);
    assert!(src.outputs.iter().all(|o| o.digest.starts_with("sha256:") && o.last_transition_time.is_some()));
    assert_eq!(by_name(&statuses, "image-builder").inputs[0].name, "src");

    // Pass 3: everything resolves.
    repo.set_object_status(&img, json!({ "latestImage": "registry.local/app@sha256:1" }));
    let mut statuses = ResourceStatuses::new(statuses.current().to_vec());
    Realizer.realize(&rr, &sc, &mut statuses).await.unwrap();
    let config = repo.object(&cfg).unwrap();
    assert_eq!(config["data"]["image"], json!("registry.local/app@sha256:1"));
    assert_eq!(config["data"]["port"], json!("port=9090"));
    for s in statuses.current() {
        assert_eq!(condition(s, RESOURCE_SUBMITTED).status, ConditionStatus::True, "resource {}", s.name);
        assert_eq!(condition(s, "Ready").status, ConditionStatus::True);
    }
    assert_eq!(by_name(&statuses, "app-config").outputs[0].name, "config");

    // Pass 4: nothing changed, nothing re-applied, statuses identical.
    let applies = repo.applies().len();
    let mut again = ResourceStatuses::new(statuses.current().to_vec());
    Realizer.realize(&rr, &sc, &mut again).await.unwrap();
    assert_eq!(repo.applies().len(), applies);
    assert!(!again.is_changed());
}

#[tokio::test]
async fn cycles_stamp_nothing() {
    let repo = Arc::new(InMemoryRepository::new());
    install_templates(&repo);
    let w = workload(&repo);
    let mut a = entry("a", "ClusterConfigTemplate", "cfg-tpl");
    a.images = vec![ResourceBinding { name: "b".into(), resource: "b".into() }];
    let mut b = entry("b", "ClusterImageTemplate", "kpack-tpl");
    b.configs = vec![ResourceBinding { name: "a".into(), resource: "a".into() }];
    let sc = chain(vec![a, b]);
    let rr = ResourceRealizer::new(repo.clone() as Arc<dyn Repository>, Arc::new(JsonPathEvaluator), &w, &sc).unwrap();

    let mut statuses = ResourceStatuses::new(vec![]);
    let err = Realizer.realize(&rr, &sc, &mut statuses).await.unwrap_err();
    assert!(matches!(err, RealizeError::Cycle { ref resources, .. } if resources == &vec!["a".to_string(), "b".to_string()]));
    assert!(repo.applies().is_empty());
    assert_eq!(statuses.current().len(), 2);
    assert!(statuses.current().iter().all(|s| condition(s, RESOURCE_SUBMITTED).reason == "TemplateInputsError"));
}

#[tokio::test]
async fn missing_template_keeps_previous_stamped_ref() {
    let repo = Arc::new(InMemoryRepository::new());
    let w = workload(&repo);
    let sc = chain(vec![entry("deploy", "ClusterTemplate", "dep-tpl")]);
    let rr = ResourceRealizer::new(repo.clone() as Arc<dyn Repository>, Arc::new(JsonPathEvaluator), &w, &sc).unwrap();
    let previous = ResourceStatus {
        name: "deploy".into(),
        stamped_ref: Some(stamped("apps/v1", "Deployment", "app-deploy")),
        ..Default::default()
    };

    let mut statuses = ResourceStatuses::new(vec![previous.clone()]);
    let err = Realizer.realize(&rr, &sc, &mut statuses).await.unwrap_err();
    assert!(matches!(err, RealizeError::TemplateResolution { .. }));
    assert!(!err.is_unhandled());
    assert_eq!(statuses.current()[0].stamped_ref, previous.stamped_ref);
    assert!(statuses.orphans().is_empty());
}

#[tokio::test]
async fn rejected_apply_records_the_new_reference() {
    let repo = Arc::new(InMemoryRepository::new());
    install_templates(&repo);
    repo.reject_applies_of("app-source", "spec.url: Invalid value");
    let w = workload(&repo);
    let sc = chain(vec![entry("source-provider", "ClusterSourceTemplate", "git-tpl")]);
    let rr = ResourceRealizer::new(repo.clone() as Arc<dyn Repository>, Arc::new(JsonPathEvaluator), &w, &sc).unwrap();

    let mut statuses = ResourceStatuses::new(vec![]);
    let err = Realizer.realize(&rr, &sc, &mut statuses).await.unwrap_err();
    assert!(matches!(err, RealizeError::ApplyStampedObject { .. }));
    assert!(!err.is_unhandled());
    assert_eq!(err.condition_reason(), "ApplyStampedObjectError");
    assert_eq!(statuses.current()[0].stamped_ref.as_ref().map(|r| r.name.as_str()), Some("app-source"));
}

#[tokio::test]
async fn workload_without_uid_cannot_own_objects() {
    let mut w = Workload::new("app", WorkloadSpec::default());
    w.metadata.namespace = Some("w1".into());
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let err = ResourceRealizer::new(repo, Arc::new(JsonPathEvaluator), &w, &chain(vec![])).err().unwrap();
    assert!(matches!(err, RealizeError::RealizerBuild(_)));
}
