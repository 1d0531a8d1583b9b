//! Access to the DataWorkflowServices custom resources.
pub mod api;
pub mod client;
pub mod objects;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub const DWS_GROUP: &str = "dataworkflowservices.github.io";
pub const DWS_API_VERSION: &str = "v1alpha2";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifies one custom resource collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crd {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl Crd {
    const fn dws(kind: &'static str, plural: &'static str) -> Self {
        Self {
            group: DWS_GROUP,
            version: DWS_API_VERSION,
            kind,
            plural,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

pub const WORKFLOW_CRD: Crd = Crd::dws("Workflow", "workflows");
pub const STORAGE_CRD: Crd = Crd::dws("Storage", "storages");
pub const DIRECTIVE_BREAKDOWN_CRD: Crd = Crd::dws("DirectiveBreakdown", "directivebreakdowns");
pub const COMPUTES_CRD: Crd = Crd::dws("Computes", "computes");
pub const SERVERS_CRD: Crd = Crd::dws("Servers", "servers");
pub const SYSTEM_CONFIGURATION_CRD: Crd = Crd::dws("SystemConfiguration", "systemconfigurations");
pub const CLIENT_MOUNT_CRD: Crd = Crd::dws("ClientMount", "clientmounts");
pub const DATA_MOVEMENT_CRD: Crd = Crd {
    group: "nnf.cray.hpe.com",
    version: "v1alpha6",
    kind: "NnfDataMovement",
    plural: "nnfdatamovements",
};
pub const SECRET_RESOURCE: Crd = Crd {
    group: "",
    version: "v1",
    kind: "Secret",
    plural: "secrets",
};

/// Label selector matching objects that DWS created on behalf of the given workflow.
pub fn workflow_label_selector(workflow_name: &str) -> String {
    format!(
        "{DWS_GROUP}/workflow.name={workflow_name},{DWS_GROUP}/workflow.namespace={DEFAULT_NAMESPACE}"
    )
}
