//! Lease-based leader election.
//!
//! At most one coordinator instance mutates cluster-wide state. The lock is
//! a coordination.k8s.io Lease: 30 s duration, 15 s renew deadline, 5 s
//! retry period, released on cancel. Losing the lease is always surfaced
//! through [`LeaderEvent::StoppedLeading`], never silent.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use monobuild_core::{Error, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_DEADLINE: Duration = Duration::from_secs(15);
const RETRY_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderEvent {
    StartedLeading,
    StoppedLeading,
}

pub struct LeaderElection {
    leases: Api<Lease>,
    name: String,
    identity: String,
}

impl LeaderElection {
    pub fn new(
        client: Client,
        namespace: &str,
        name: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        LeaderElection {
            leases: Api::namespaced(client, namespace),
            name: name.into(),
            identity: identity.into(),
        }
    }

    /// Acquire the lease, then keep renewing it. Events are delivered on
    /// `events`; a dropped shutdown signal releases the lease.
    pub async fn run(
        self,
        events: mpsc::Sender<LeaderEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => debug!(lease = %self.name, "Lease held by another instance"),
                Err(e) => warn!(lease = %self.name, error = %e, "Lease acquisition failed"),
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
            }
        }

        info!(lease = %self.name, identity = %self.identity, "Started leading");
        let _ = events.send(LeaderEvent::StartedLeading).await;

        let mut last_renew = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.release().await;
                    return;
                }
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
            }

            match self.try_acquire().await {
                Ok(true) => last_renew = Instant::now(),
                Ok(false) => {
                    warn!(lease = %self.name, "Lease taken over by another instance");
                    let _ = events.send(LeaderEvent::StoppedLeading).await;
                    return;
                }
                Err(e) => {
                    warn!(lease = %self.name, error = %e, "Lease renewal failed");
                    if last_renew.elapsed() > RENEW_DEADLINE {
                        let _ = events.send(LeaderEvent::StoppedLeading).await;
                        return;
                    }
                }
            }
        }
    }

    /// Claim or renew the lease. Returns false when another live holder
    /// owns it.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());

        let existing = self
            .leases
            .get_opt(&self.name)
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Lost the creation race.
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(Error::Transient(e.to_string())),
            };
        };

        let spec = lease.spec.get_or_insert_with(Default::default);
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        if !held_by_us && !Self::expired(spec) {
            return Ok(false);
        }

        if !held_by_us {
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
            spec.acquire_time = Some(now.clone());
        }
        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
        spec.renew_time = Some(now);

        match self
            .leases
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            // Someone else updated the lease concurrently.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(Error::Transient(e.to_string())),
        }
    }

    fn expired(spec: &LeaseSpec) -> bool {
        let Some(renew) = spec.renew_time.as_ref() else {
            return true;
        };
        let duration = spec
            .lease_duration_seconds
            .unwrap_or(LEASE_DURATION.as_secs() as i32) as i64;
        Utc::now()
            .signed_duration_since(renew.0)
            .num_seconds()
            > duration
    }

    /// Release on cancel: give up the lease so the next instance does not
    /// wait out the full duration.
    async fn release(&self) {
        let Ok(Some(mut lease)) = self.leases.get_opt(&self.name).await else {
            return;
        };
        let holds = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str());
        if !holds {
            return;
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .leases
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => info!(lease = %self.name, "Released lease"),
            Err(e) => warn!(lease = %self.name, error = %e, "Failed to release lease"),
        }
    }
}
