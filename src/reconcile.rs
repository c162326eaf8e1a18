//! Reconcile driver shared by every record kind.
//!
//! A pass attaches the finalizer on first sight, runs either the provisioning
//! or the finalization path of the kind, and always ends by writing the ready
//! condition together with the observed generation. The finalizer is released
//! last, only after finalization succeeded.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams, Resource, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
};
use opentelemetry::trace::TraceId;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};
use tracing::*;

use crate::{
    Context, Error, FINALIZER, Result,
    conditions::{self, Conditions, reasons},
    index, telemetry,
};

/// A record kind the controller provisions
#[async_trait]
pub trait Reconcile:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    type Status: Conditions + Serialize + Default + Clone + Send + Sync;

    const READY_CONDITION: &'static str;
    const SUCCESS_REASON: &'static str;
    const FAILURE_REASON: &'static str;

    fn status(&self) -> Option<&Self::Status>;

    /// Reconcile deadline declared on the record, in Go duration notation
    fn timeout(&self) -> Option<&str> {
        None
    }

    async fn apply(&self, ctx: &Context, status: &mut Self::Status) -> Result<()>;

    async fn cleanup(&self, ctx: &Context, status: &mut Self::Status) -> Result<()>;
}

#[instrument(skip(obj, ctx), fields(trace_id, kind = %K::kind(&()), name = %obj.name_any()))]
pub async fn reconcile<K: Reconcile>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let kind = K::kind(&()).to_string();
    let _timer = ctx.metrics.reconcile.count_and_measure(&kind, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = obj.name_any();
    let api: Api<K> = Api::namespaced(ctx.kube_client.clone(), &namespace);
    let deleting = obj.meta().deletion_timestamp.is_some();

    if !has_finalizer(obj.as_ref()) {
        if deleting {
            ctx.backoff.reset(&backoff_key(obj.as_ref()));
            return Ok(Action::await_change());
        }

        debug!("Attaching finalizer to {kind} \"{name}\" in {namespace}");
        return match add_finalizer(&api, obj.as_ref()).await {
            Ok(_) => Ok(Action::requeue(Duration::from_secs(1))),
            Err(e) if e.is_not_found() => Ok(Action::await_change()),
            Err(e) => Err(e),
        };
    }

    info!("Reconciling {kind} \"{name}\" in {namespace}");

    let was_ready = obj
        .status()
        .and_then(|s| s.condition(K::READY_CONDITION))
        .is_some_and(|c| c.is_true());
    let mut status = obj.status().cloned().unwrap_or_default();

    let outcome = if deleting {
        bounded(obj.timeout(), obj.cleanup(&ctx, &mut status)).await
    } else {
        bounded(obj.timeout(), obj.apply(&ctx, &mut status)).await
    };

    match &outcome {
        Ok(()) if deleting => status.set_condition(
            K::READY_CONDITION,
            false,
            reasons::FINALIZED,
            &format!("{kind} {name} released"),
        ),
        Ok(()) => {
            status.set_condition(
                K::READY_CONDITION,
                true,
                K::SUCCESS_REASON,
                &format!("{kind} {name} is provisioned"),
            );
            if !was_ready {
                publish(&ctx, obj.as_ref(), K::SUCCESS_REASON, format!("Provisioned `{name}`"), "Provisioning").await;
            }
        }
        Err(err) => {
            let reason = err.reason().unwrap_or(if deleting {
                reasons::FINALIZATION_FAILED
            } else {
                K::FAILURE_REASON
            });
            status.set_condition(K::READY_CONDITION, false, reason, &err.to_string());
            publish(&ctx, obj.as_ref(), reason, err.to_string(), "Reconciling").await;
        }
    }
    status.set_observed_generation(obj.meta().generation);

    let written = match conditions::patch_status(&api, obj.as_ref(), &status).await {
        Ok(updated) => updated,
        Err(e) if e.is_not_found() => {
            ctx.backoff.reset(&backoff_key(obj.as_ref()));
            return outcome.map(|_| Action::await_change());
        }
        Err(e) => {
            warn!("Writing status of {kind} \"{name}\" failed: {e}");
            return Err(outcome.err().unwrap_or(e));
        }
    };

    outcome?;

    if deleting {
        match remove_finalizer(&api, &written).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        publish(&ctx, obj.as_ref(), reasons::FINALIZED, format!("Released `{name}`"), "Finalizing").await;
    }

    ctx.backoff.reset(&backoff_key(obj.as_ref()));
    Ok(Action::await_change())
}

pub fn error_policy<K: Reconcile>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);

    ctx.metrics
        .reconcile
        .set_failure(&K::kind(&()), obj.name_any(), error);
    Action::requeue(ctx.backoff.next(&backoff_key(obj.as_ref())))
}

fn backoff_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}", K::kind(&()), index::key_of(obj))
}

pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

/// Append the finalizer, guarded by the resource version the reconcile read.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(api, obj, finalizers).await
}

pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let finalizers = obj
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, obj, finalizers).await
}

async fn patch_finalizers<K>(api: &Api<K>, obj: &K, finalizers: Vec<String>) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)
}

async fn publish<K: Resource<DynamicType = ()>>(
    ctx: &Context,
    obj: &K,
    reason: &str,
    note: String,
    action: &str,
) {
    let event = Event {
        type_: EventType::Normal,
        reason: reason.into(),
        note: Some(note),
        action: action.into(),
        secondary: None,
    };
    if let Err(e) = ctx.recorder.publish(&event, &obj.object_ref(&())).await {
        warn!("Publishing event failed: {e}");
    }
}

/// Run `fut`, aborting it once the declared timeout elapses.
pub async fn bounded<T>(timeout: Option<&str>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout.map(parse_duration).transpose()? {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => fut.await,
    }
}

/// Parse a Go style duration such as `1m30s`, `250ms` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::InvalidTimeout(input.to_string());

    let mut rest = input.trim();
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut seconds = 0f64;
    while !rest.is_empty() {
        let unit_start = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(unit_start);
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };

        seconds += value * scale;
        rest = tail;
    }

    if !seconds.is_finite() {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap().as_millis(), 250);
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_durations() {
        for input in [
            "",
            "30",
            "s",
            "-1s",
            "10 parsecs",
            "1d",
            "99999999999999999999999h",
        ] {
            assert!(
                matches!(parse_duration(input), Err(Error::InvalidTimeout(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn bounded_without_timeout_runs_to_completion() {
        let value = bounded(None, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_aborts_slow_work() {
        let err = bounded(Some("1s"), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(1)));
        assert_eq!(err.reason(), Some(reasons::RECONCILE_TIMEOUT));
    }

    #[tokio::test]
    async fn bounded_rejects_invalid_timeout() {
        let err = bounded(Some("soon"), async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.reason(), Some(reasons::INVALID_TIMEOUT));
    }
}
