//! Status conditions for provisioning records.
//!
//! A condition reports a single named axis of readiness. Conditions are matched
//! by `type`; writing a condition with an unchanged `(status, reason)` keeps the
//! original `lastTransitionTime`.

use chrono::{DateTime, SecondsFormat, Utc};
use kube::{
    Resource, ResourceExt,
    api::{Api, Patch, PatchParams},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::fmt::Debug;

use crate::{Error, Result};

pub mod types {
    pub const DATABASE_READY: &str = "DatabaseReady";
    pub const USER_READY: &str = "UserReady";
    pub const EXTENSIONS_READY: &str = "ExtensionsReady";
    pub const SCHEMAS_READY: &str = "SchemasReady";
}

pub mod reasons {
    pub const SECRET_NOT_FOUND: &str = "SecretNotFoundFailed";
    pub const CREDENTIALS_NOT_FOUND: &str = "CredentialsNotFound";
    pub const DATABASE_NOT_FOUND: &str = "DatabaseNotFoundReason";
    pub const CONNECTION_FAILED: &str = "ConnectionFailed";
    pub const CREATE_DATABASE_FAILED: &str = "CreateDatabaseFailed";
    pub const CREATE_EXTENSIONS_FAILED: &str = "CreateExtensionsFailed";
    pub const CREATE_SCHEMAS_FAILED: &str = "CreateSchemasFailed";
    pub const USER_PROVISIONING_FAILED: &str = "UserProvisioningFailed";
    pub const DATABASE_PROVISIONING_FAILED: &str = "DatabaseProvisioningFailed";
    pub const FINALIZATION_FAILED: &str = "FinalizationFailed";
    pub const INVALID_TIMEOUT: &str = "InvalidTimeout";
    pub const RECONCILE_TIMEOUT: &str = "ReconcileTimeout";

    pub const USER_PROVISIONING_SUCCESSFUL: &str = "UserProvisioningSuccessful";
    pub const DATABASE_PROVISIONING_SUCCESSFUL: &str = "DatabaseProvisioningSuccessful";
    pub const EXTENSIONS_CREATED: &str = "ExtensionsCreated";
    pub const SCHEMAS_CREATED: &str = "SchemasCreated";
    pub const FINALIZED: &str = "Finalized";
}

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == TRUE
    }
}

/// Status subresources that carry conditions and an observed generation.
pub trait Conditions {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn set_observed_generation(&mut self, generation: Option<i64>);

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    fn set_condition(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        set_condition_at(
            self.conditions_mut(),
            type_,
            status,
            reason,
            message,
            Utc::now(),
        );
    }
}

/// Replaces the condition matching `type_` in place, or appends it.
pub fn set_condition_at(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let status = if status { TRUE } else { FALSE };
    let now = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status || existing.reason != reason {
                existing.last_transition_time = now;
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        }),
    }
}

/// Writes `status` to the status subresource of `obj`.
///
/// The merge patch carries the resource version the reconcile started from, so
/// a concurrent writer turns this into a conflict and the record is requeued.
pub async fn patch_status<K, S>(api: &Api<K>, obj: &K, status: &S) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let mut patch = json!({ "status": status });
    if let Some(rv) = obj.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }

    api.patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn appends_new_condition() {
        let mut conditions = vec![];
        set_condition_at(
            &mut conditions,
            types::USER_READY,
            false,
            reasons::DATABASE_NOT_FOUND,
            "database nope not found",
            at(0),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "UserReady");
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].reason, "DatabaseNotFoundReason");
        assert_eq!(conditions[0].last_transition_time, "2023-11-14T22:13:20Z");
    }

    #[test]
    fn identical_status_and_reason_keeps_transition_time() {
        let mut conditions = vec![];
        set_condition_at(&mut conditions, types::USER_READY, true, reasons::USER_PROVISIONING_SUCCESSFUL, "a", at(0));
        set_condition_at(&mut conditions, types::USER_READY, true, reasons::USER_PROVISIONING_SUCCESSFUL, "b", at(60));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "b");
        assert_eq!(conditions[0].last_transition_time, "2023-11-14T22:13:20Z");
    }

    #[test]
    fn changed_reason_moves_transition_time() {
        let mut conditions = vec![];
        set_condition_at(&mut conditions, types::DATABASE_READY, false, reasons::SECRET_NOT_FOUND, "", at(0));
        set_condition_at(&mut conditions, types::DATABASE_READY, false, reasons::CONNECTION_FAILED, "", at(30));
        assert_eq!(conditions[0].last_transition_time, "2023-11-14T22:13:50Z");

        set_condition_at(&mut conditions, types::DATABASE_READY, true, reasons::DATABASE_PROVISIONING_SUCCESSFUL, "", at(90));
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].last_transition_time, "2023-11-14T22:14:50Z");
    }

    #[test]
    fn only_matching_type_is_replaced() {
        let mut conditions = vec![];
        set_condition_at(&mut conditions, types::EXTENSIONS_READY, true, reasons::EXTENSIONS_CREATED, "", at(0));
        set_condition_at(&mut conditions, types::DATABASE_READY, false, reasons::CREATE_SCHEMAS_FAILED, "", at(1));
        set_condition_at(&mut conditions, types::DATABASE_READY, true, reasons::DATABASE_PROVISIONING_SUCCESSFUL, "", at(2));

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "ExtensionsReady");
        assert_eq!(conditions[1].type_, "DatabaseReady");
        assert!(conditions[1].is_true());
    }

    #[test]
    fn serializes_with_kubernetes_field_names() {
        let condition = Condition {
            type_: types::SCHEMAS_READY.into(),
            status: TRUE.into(),
            reason: reasons::SCHEMAS_CREATED.into(),
            message: String::new(),
            last_transition_time: "2023-11-14T22:13:20Z".into(),
        };
        assert_eq!(
            serde_json::to_value(&condition).unwrap(),
            json!({
                "type": "SchemasReady",
                "status": "True",
                "reason": "SchemasCreated",
                "message": "",
                "lastTransitionTime": "2023-11-14T22:13:20Z",
            })
        );
    }
}
