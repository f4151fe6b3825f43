// Model profile custom resource
//
// A profile is a named bundle of backend parameters: which model to load
// and how to shape the vLLM server around it. Profiles are created and
// updated externally in the control plane; the proxy only reads them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec of the `ModelProfile` custom resource
///
/// Field names mirror the vLLM flags they turn into; `None` means the flag
/// is omitted and vLLM's own default applies.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "serving.podchill.io",
    version = "v1alpha1",
    kind = "ModelProfile",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModelProfileSpec {
    /// HuggingFace id or local path of the model to load
    pub model_name: String,

    /// Name the backend serves the model under (defaults to the profile id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_model_len: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_utilization: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_chunked_prefill: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_batched_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_seqs: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Parser the backend uses to turn model output into tool calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_parser: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_parser: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_auto_tool_choice: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_prefix_caching: Option<bool>,

    /// CPU offload in GiB; falls back to the proxy-wide default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_offload_gb: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_custom_all_reduce: Option<bool>,
}

impl ModelProfile {
    /// Profile id: the resource name
    pub fn id(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Name the backend advertises for this profile
    pub fn served_name(&self) -> String {
        self.spec
            .served_model_name
            .clone()
            .unwrap_or_else(|| self.id())
    }
}

/// Build a profile in memory (tests and fakes)
#[cfg(test)]
pub fn test_profile(id: &str, model_name: &str) -> ModelProfile {
    let mut profile = ModelProfile::new(
        id,
        ModelProfileSpec {
            model_name: model_name.to_string(),
            ..ModelProfileSpec::default()
        },
    );
    profile.metadata.namespace = Some("default".to_string());
    profile
}
