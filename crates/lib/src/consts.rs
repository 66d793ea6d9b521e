/// Application name used for config directories.
pub const APP_NAME: &str = "kmigrate";

/// Subdirectory holding successfully exported (or transformed) resources.
pub const RESOURCES_DIR: &str = "resources";

/// Subdirectory holding per-resource failure records.
pub const FAILURES_DIR: &str = "failures";

/// Subdirectory of `resources/<namespace>` holding opt-in cluster-scoped objects.
pub const CLUSTER_DIR: &str = "_cluster";

/// File name of the transform report written next to the transformed tree.
pub const TRANSFORM_REPORT: &str = "report.yaml";

/// Name suffix used for list-level failure records (`<Kind>-_list.yaml`).
pub const LIST_FAILURE_NAME: &str = "_list";

/// Extension of every manifest file in a resource tree.
pub const MANIFEST_EXT: &str = "yaml";

/// Client-side defaults (requests per second / burst).
pub const DEFAULT_QPS: u32 = 100;
pub const DEFAULT_BURST: u32 = 1000;

/// Upper bound for the export/apply worker pool, regardless of burst.
pub const MAX_WORKERS: usize = 32;

/// Annotation carrying the client-side applied configuration.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Label put on every transient transfer object.
pub const TRANSFER_SESSION_LABEL: &str = "kmigrate.io/transfer-session";

/// Prefix of transient transfer object names.
pub const TRANSFER_NAME_PREFIX: &str = "kmigrate-transfer";

/// Default image for data-plane endpoints (needs `tar`, `find`, `sha256sum`).
pub const DEFAULT_TRANSFER_IMAGE: &str = "busybox:1.36";

/// Kubernetes object names are limited to 63 characters for labels and pod names.
pub const MAX_NAME_LEN: usize = 63;
