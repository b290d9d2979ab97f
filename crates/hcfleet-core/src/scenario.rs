//! Built-in fleet scenarios against the passthrough DNA.
//!
//! Each scenario expects a freshly initialized cluster, provisions its own
//! instances and returns a report of named checks. Assertions are recorded,
//! not raised; infrastructure failures (RPC, transport) are errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::barrier::QuorumOutcome;
use crate::batch::{BatchMapper, Iteration};
use crate::channel::{ChannelManager, ZomeOutcome};
use crate::cluster::Cluster;
use crate::consistency::Address;
use crate::error::{FleetError, FleetResult};

/// Zome exposed by the passthrough DNA
pub const ZOME: &str = "main";

#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    pub dna_path: PathBuf,
    pub instances_per_conductor: usize,
    /// Deadline for signal quorums
    pub quorum_timeout: Duration,
}

impl ScenarioOptions {
    pub fn new(dna_path: impl Into<PathBuf>) -> Self {
        Self {
            dna_path: dna_path.into(),
            instances_per_conductor: 1,
            quorum_timeout: Duration::from_secs(60),
        }
    }

    pub fn instance_ids(&self) -> Vec<String> {
        (0..self.instances_per_conductor)
            .map(|n| format!("instance-{}", n))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub name: String,
    pub checks: Vec<Check>,
}

impl ScenarioReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checks: Vec::new(),
        }
    }

    /// Record a check and log its result; returns `passed`.
    pub fn check(&mut self, name: &str, passed: bool, detail: impl Into<String>) -> bool {
        let detail = detail.into();
        if passed {
            tracing::info!(scenario = %self.name, check = name, "ok");
        } else {
            tracing::error!(scenario = %self.name, check = name, detail = %detail, "FAILED");
        }
        self.checks.push(Check {
            name: name.to_string(),
            passed,
            detail,
        });
        passed
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Create the configured instances on every member. Instances on one
/// conductor are created one after another since each attach bounces the
/// instance channel; conductors proceed concurrently.
pub async fn provision_instances(cluster: &Cluster, options: &ScenarioOptions) -> FleetResult<()> {
    let ids = options.instance_ids();
    cluster
        .batch(|member| {
            let ids = ids.clone();
            let dna = options.dna_path.clone();
            async move {
                for id in &ids {
                    member.create_dna_instance(id, &dna).await?;
                }
                Ok::<_, FleetError>(())
            }
        })
        .await?;
    Ok(())
}

pub async fn commit_entry(
    member: &ChannelManager,
    instance_id: &str,
    content: &str,
) -> FleetResult<ZomeOutcome> {
    let raw = member
        .call_zome(instance_id, ZOME, "commit_entry", json!({ "content": content }))
        .await?;
    Ok(ZomeOutcome::from_value(raw))
}

pub async fn link_entries(
    member: &ChannelManager,
    instance_id: &str,
    base: &Address,
    target: &Address,
) -> FleetResult<ZomeOutcome> {
    let raw = member
        .call_zome(
            instance_id,
            ZOME,
            "link_entries",
            json!({ "base": base, "target": target }),
        )
        .await?;
    Ok(ZomeOutcome::from_value(raw))
}

/// Number of links on `base`, or `None` when the call returned an error
pub async fn count_links(
    member: &ChannelManager,
    instance_id: &str,
    base: &Address,
) -> FleetResult<Option<usize>> {
    let raw = member
        .call_zome(instance_id, ZOME, "get_links", json!({ "base": base }))
        .await?;
    Ok(match ZomeOutcome::from_value(raw) {
        ZomeOutcome::Ok(value) => value
            .get("links")
            .and_then(Value::as_array)
            .map(Vec::len),
        ZomeOutcome::Err(_) => None,
    })
}

fn address_of(outcome: &ZomeOutcome) -> Option<Address> {
    match outcome {
        ZomeOutcome::Ok(Value::String(address)) => Some(Address::new(address.as_str())),
        _ => None,
    }
}

fn first_instance(member: &ChannelManager) -> FleetResult<String> {
    member.instance_ids().into_iter().next().ok_or_else(|| {
        FleetError::InvalidOperation(format!("{} has no instances", member.peer_id()))
    })
}

fn first_member(cluster: &Cluster) -> FleetResult<Arc<ChannelManager>> {
    cluster
        .members()
        .into_iter()
        .next()
        .ok_or_else(|| FleetError::InvalidOperation("cluster has no members".to_string()))
}

/// Every instance commits an entry, one instance links a base to all of
/// them, then every instance must see every link.
pub async fn links(
    cluster: &Cluster,
    options: &ScenarioOptions,
    iteration: Iteration,
) -> FleetResult<ScenarioReport> {
    let name = match iteration {
        Iteration::Series => "links: one at a time",
        Iteration::Parallel => "links: all at once",
    };
    let mut report = ScenarioReport::new(name);
    provision_instances(cluster, options).await?;

    let mapper = cluster.mapper().iteration(iteration);
    let total = mapper.len();
    let commits = mapper
        .map_instances(|item| async move {
            let content = format!("entry-{}-{}", item.owner_index, item.unit_index);
            commit_entry(&item.owner, &item.unit, &content).await
        })
        .await?;
    let hashes: Vec<Address> = commits.iter().filter_map(address_of).collect();
    report.check(
        "every commit returned an address",
        hashes.len() == total,
        format!("{} of {} commits succeeded", hashes.len(), total),
    );

    let consistency = cluster.check_consistency(&hashes).await?;
    report.check(
        "entries consistent",
        consistency.is_consistent(),
        format!("{} entries without a holder", consistency.missing_count),
    );

    let author = first_member(cluster)?;
    let author_instance = first_instance(&author)?;
    let base = match address_of(&commit_entry(&author, &author_instance, "base").await?) {
        Some(base) => base,
        None => {
            report.check("base committed", false, "commit of base entry failed");
            return Ok(report);
        }
    };

    let linker = BatchMapper::new(vec![(author.clone(), hashes.clone())]).iteration(iteration);
    let link_results = linker
        .map_instances(|item| {
            let instance = author_instance.clone();
            let base = base.clone();
            async move { link_entries(&item.owner, &instance, &base, &item.unit).await }
        })
        .await?;
    let linked = link_results
        .iter()
        .filter(|r| matches!(r, ZomeOutcome::Ok(_)))
        .count();
    report.check(
        "every link succeeded",
        linked == total && link_results.len() == total,
        format!("{} of {} links succeeded", linked, total),
    );

    let mut expected = hashes;
    expected.push(base.clone());
    let consistency = cluster.check_consistency(&expected).await?;
    report.check(
        "entries and base consistent",
        consistency.is_consistent(),
        format!("{} addresses without a holder", consistency.missing_count),
    );

    let counts = cluster
        .mapper()
        .iteration(iteration)
        .map_instances(|item| {
            let base = base.clone();
            async move { count_links(&item.owner, &item.unit, &base).await }
        })
        .await?;
    let complete = counts.iter().filter(|c| **c == Some(total)).count();
    report.check(
        "every instance sees every link",
        complete == counts.len(),
        format!("{} of {} instances saw {} links: {:?}", complete, counts.len(), total, counts),
    );

    Ok(report)
}

/// Member 0 links a base to a target; member 1 must see exactly that link.
pub async fn link_visibility(
    cluster: &Cluster,
    options: &ScenarioOptions,
) -> FleetResult<ScenarioReport> {
    let mut report = ScenarioReport::new("link visibility");
    let members = cluster.members();
    if members.len() < 2 {
        return Err(FleetError::InvalidOperation(
            "link visibility needs at least two conductors".to_string(),
        ));
    }
    provision_instances(cluster, options).await?;

    let (author, reader) = (&members[0], &members[1]);
    let author_instance = first_instance(author)?;
    let reader_instance = first_instance(reader)?;

    let base = address_of(&commit_entry(author, &author_instance, "base").await?);
    let target = address_of(&commit_entry(author, &author_instance, "target").await?);
    let (base, target) = match (base, target) {
        (Some(base), Some(target)) => (base, target),
        _ => {
            report.check("entries committed", false, "commit returned no address");
            return Ok(report);
        }
    };
    let link = link_entries(author, &author_instance, &base, &target).await?;
    report.check("link committed", matches!(link, ZomeOutcome::Ok(_)), format!("{:?}", link));

    let consistency = cluster.check_consistency(&[base.clone(), target]).await?;
    report.check(
        "consistent",
        consistency.is_consistent(),
        format!("{} addresses without a holder", consistency.missing_count),
    );

    let count = count_links(reader, &reader_instance, &base).await?;
    report.check(
        "reader sees exactly one link",
        count == Some(1),
        format!("get_links returned {:?}", count),
    );
    Ok(report)
}

/// One entry plus one link must produce an entry hold and a link hold on
/// every member before the quorum deadline.
///
/// The link base is committed and its holds drained before the quorum
/// barrier is armed, so that barrier only sees holds of the target entry
/// and of the link.
pub async fn hold_quorum(cluster: &Cluster, options: &ScenarioOptions) -> FleetResult<ScenarioReport> {
    let mut report = ScenarioReport::new("hold quorum");
    provision_instances(cluster, options).await?;

    let author = first_member(cluster)?;
    let instance = first_instance(&author)?;

    let base_holds = cluster.hold_barrier(cluster.len(), options.quorum_timeout)?;
    let Some(base) = address_of(&commit_entry(&author, &instance, "base").await?) else {
        report.check("base committed", false, "commit returned no address");
        return Ok(report);
    };
    let (held, holds) = match base_holds.wait().await {
        QuorumOutcome::Reached { count, .. } => (true, count),
        QuorumOutcome::TimedOut { count, .. } => (false, count),
    };
    let settled = cluster.check_consistency(&[base.clone()]).await?;
    if !report.check(
        "base consistent",
        held && settled.is_consistent(),
        format!(
            "{} of {} base holds, {} addresses unheld after {} rounds",
            holds,
            cluster.len(),
            settled.missing_count,
            settled.rounds
        ),
    ) {
        return Ok(report);
    }

    let required = cluster.len() * 2;
    let barrier = cluster.hold_barrier(required, options.quorum_timeout)?;

    let Some(target) = address_of(&commit_entry(&author, &instance, "target").await?) else {
        report.check("target committed", false, "commit returned no address");
        return Ok(report);
    };
    let link = link_entries(&author, &instance, &base, &target).await?;
    if !report.check("link committed", matches!(link, ZomeOutcome::Ok(_)), format!("{:?}", link)) {
        return Ok(report);
    }

    match barrier.wait().await {
        QuorumOutcome::Reached { count, elapsed } => {
            report.check(
                "hold quorum reached",
                true,
                format!("{} holds after {:?}", count, elapsed),
            );
        }
        QuorumOutcome::TimedOut { count, required } => {
            report.check(
                "hold quorum reached",
                false,
                format!("{} of {} holds before the deadline", count, required),
            );
        }
    }
    Ok(report)
}
