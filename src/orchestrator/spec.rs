// Pod spec derivation
//
// A model profile deterministically maps to one pod spec: the vLLM
// container, its flag list, the GPU resource request, and a readiness
// probe on the backend's /health. The derived flag list is hashed into an
// annotation so the drift reconciler can compare a live pod against the
// profile without diffing full specs.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, Pod, PodSpec, Probe, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::registry::ModelProfile;

/// Annotation carrying the profile fingerprint on the live pod
pub const FINGERPRINT_ANNOTATION: &str = "podchill.io/profile-fingerprint";

/// Label marking pods managed by this proxy
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// vLLM server flags for a profile
///
/// Order is fixed so the fingerprint is stable across restarts.
pub fn vllm_args(config: &Config, profile: &ModelProfile) -> Vec<String> {
    let spec = &profile.spec;
    let mut args = vec![
        "--model".to_string(),
        spec.model_name.clone(),
        "--served-model-name".to_string(),
        profile.served_name(),
        "--port".to_string(),
        config.backend_port.to_string(),
    ];

    let mut push_opt = |flag: &str, value: Option<String>| {
        if let Some(v) = value {
            args.push(flag.to_string());
            args.push(v);
        }
    };

    push_opt(
        "--tensor-parallel-size",
        spec.tensor_parallel_size.map(|v| v.to_string()),
    );
    push_opt("--max-model-len", spec.max_model_len.map(|v| v.to_string()));
    push_opt(
        "--gpu-memory-utilization",
        spec.gpu_memory_utilization.map(|v| format!("{:.2}", v)),
    );
    push_opt(
        "--max-num-batched-tokens",
        spec.max_num_batched_tokens.map(|v| v.to_string()),
    );
    push_opt("--max-num-seqs", spec.max_num_seqs.map(|v| v.to_string()));
    push_opt("--dtype", spec.dtype.clone());
    push_opt("--tool-call-parser", spec.tool_call_parser.clone());
    push_opt("--reasoning-parser", spec.reasoning_parser.clone());

    let cpu_offload = spec.cpu_offload_gb.unwrap_or(config.cpu_offload_gb);
    if cpu_offload > 0 {
        args.push("--cpu-offload-gb".to_string());
        args.push(cpu_offload.to_string());
    }

    if spec.enable_chunked_prefill.unwrap_or(false) {
        args.push("--enable-chunked-prefill".to_string());
    }
    if spec.enable_auto_tool_choice.unwrap_or(false) {
        args.push("--enable-auto-tool-choice".to_string());
    }
    if spec.enable_prefix_caching.unwrap_or(false) {
        args.push("--enable-prefix-caching".to_string());
    }
    if spec.disable_custom_all_reduce.unwrap_or(false) {
        args.push("--disable-custom-all-reduce".to_string());
    }

    args
}

/// Fingerprint of the pod spec a profile derives to
///
/// Covers everything the reconciler cares about: flags, image, GPU count.
pub fn fingerprint(config: &Config, profile: &ModelProfile) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.backend_image.as_bytes());
    hasher.update([0]);
    hasher.update(config.gpu_count.to_le_bytes());
    for arg in vllm_args(config, profile) {
        hasher.update([0]);
        hasher.update(arg.as_bytes());
    }
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Build the backend pod object for a profile
pub fn build_pod(config: &Config, profile: &ModelProfile) -> Pod {
    let mut limits = BTreeMap::new();
    limits.insert(
        "nvidia.com/gpu".to_string(),
        Quantity(config.gpu_count.to_string()),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(
        FINGERPRINT_ANNOTATION.to_string(),
        fingerprint(config, profile),
    );

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), "podchill".to_string());
    labels.insert("podchill.io/model".to_string(), profile.id());

    let container = Container {
        name: "vllm".to_string(),
        image: Some(config.backend_image.clone()),
        args: Some(vllm_args(config, profile)),
        ports: Some(vec![ContainerPort {
            container_port: config.backend_port as i32,
            name: Some("http".to_string()),
            ..ContainerPort::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(limits),
            ..ResourceRequirements::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::Int(config.backend_port as i32),
                ..HTTPGetAction::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(5),
            // Model load can take minutes; the proxy's own startup
            // deadline is the real bound
            failure_threshold: Some(60),
            ..Probe::default()
        }),
        ..Container::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(config.pod_name.clone()),
            namespace: Some(config.namespace.clone()),
            annotations: Some(annotations),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::profile::test_profile;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_args_carry_model_and_port() {
        let profile = test_profile("qwen-32b", "Qwen/Qwen2.5-32B-Instruct");
        let args = vllm_args(&config(), &profile);
        assert_eq!(args[0], "--model");
        assert_eq!(args[1], "Qwen/Qwen2.5-32B-Instruct");
        assert!(args.contains(&"--served-model-name".to_string()));
        assert!(args.contains(&"8000".to_string()));
    }

    #[test]
    fn test_boolean_flags_only_when_set() {
        let mut profile = test_profile("m", "org/model");
        let args = vllm_args(&config(), &profile);
        assert!(!args.contains(&"--enable-prefix-caching".to_string()));

        profile.spec.enable_prefix_caching = Some(true);
        profile.spec.enable_chunked_prefill = Some(true);
        let args = vllm_args(&config(), &profile);
        assert!(args.contains(&"--enable-prefix-caching".to_string()));
        assert!(args.contains(&"--enable-chunked-prefill".to_string()));
    }

    #[test]
    fn test_cpu_offload_falls_back_to_config() {
        let mut cfg = config();
        cfg.cpu_offload_gb = 8;
        let profile = test_profile("m", "org/model");
        let args = vllm_args(&cfg, &profile);
        let idx = args.iter().position(|a| a == "--cpu-offload-gb").unwrap();
        assert_eq!(args[idx + 1], "8");
    }

    #[test]
    fn test_fingerprint_changes_with_profile() {
        let cfg = config();
        let a = test_profile("m", "org/model");
        let mut b = test_profile("m", "org/model");
        assert_eq!(fingerprint(&cfg, &a), fingerprint(&cfg, &b));

        b.spec.max_model_len = Some(8192);
        assert_ne!(fingerprint(&cfg, &a), fingerprint(&cfg, &b));
    }

    #[test]
    fn test_pod_carries_fingerprint_annotation() {
        let cfg = config();
        let profile = test_profile("qwen-32b", "Qwen/Qwen2.5-32B-Instruct");
        let pod = build_pod(&cfg, &profile);

        let annotations = pod.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(FINGERPRINT_ANNOTATION).unwrap(),
            &fingerprint(&cfg, &profile)
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].name, "vllm");
    }
}
