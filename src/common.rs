//! Read preferences and pluggable server selection.
use rand::{thread_rng, Rng};

use settings::DEFAULT_SECONDARY_ACCEPTABLE_LATENCY_MS;
use topology::instance::{InstanceType, ServerInstance};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Picks one instance out of a list of connected instances that is sorted
/// ascending by average ping time. Implementations must not call back into
/// the collection that owns the list.
pub trait ServerSelector {
    fn choose(&self, instances: &[Arc<ServerInstance>]) -> Option<Arc<ServerInstance>>;
}

impl<F> ServerSelector for F
    where F: Fn(&[Arc<ServerInstance>]) -> Option<Arc<ServerInstance>>
{
    fn choose(&self, instances: &[Arc<ServerInstance>]) -> Option<Arc<ServerInstance>> {
        self(instances)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub tag_sets: Vec<BTreeMap<String, String>>,
    /// Instances slower than the fastest eligible one by more than this are
    /// not considered.
    pub acceptable_latency: Duration,
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::new(ReadMode::Primary, None)
    }
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<BTreeMap<String, String>>>) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or_default(),
            acceptable_latency: Duration::from_millis(DEFAULT_SECONDARY_ACCEPTABLE_LATENCY_MS),
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::new(ReadMode::Primary, None)
    }

    pub fn nearest() -> ReadPreference {
        ReadPreference::new(ReadMode::Nearest, None)
    }

    pub fn with_acceptable_latency(mut self, latency: Duration) -> ReadPreference {
        self.acceptable_latency = latency;
        self
    }

    // Filters the ping-sorted list down to the instances this preference
    // accepts, preserving order.
    fn eligible<'a>(&self, instances: &'a [Arc<ServerInstance>]) -> Vec<&'a Arc<ServerInstance>> {
        let mut others = Vec::new();
        let mut primaries = Vec::new();
        let mut secondaries = Vec::new();
        let mut members = Vec::new();

        for instance in instances {
            match instance.instance_type() {
                InstanceType::Standalone | InstanceType::ShardRouter => others.push(instance),
                InstanceType::ReplicaSetMember => {
                    if instance.is_arbiter() {
                        continue;
                    }
                    if instance.is_primary() {
                        primaries.push(instance);
                        members.push(instance);
                    } else if instance.is_secondary() {
                        secondaries.push(instance);
                        members.push(instance);
                    }
                }
                InstanceType::Unknown => (),
            }
        }

        let chosen = match self.mode {
            ReadMode::Primary => primaries,
            ReadMode::PrimaryPreferred => {
                if primaries.is_empty() {
                    self.filter_by_tags(secondaries)
                } else {
                    primaries
                }
            }
            ReadMode::Secondary => self.filter_by_tags(secondaries),
            ReadMode::SecondaryPreferred => {
                let tagged = self.filter_by_tags(secondaries);
                if tagged.is_empty() { primaries } else { tagged }
            }
            ReadMode::Nearest => self.filter_by_tags(members),
        };

        if others.is_empty() {
            return chosen;
        }

        instances.iter()
            .filter(|instance| {
                others.iter().any(|other| same_instance(other, instance)) ||
                chosen.iter().any(|c| same_instance(c, instance))
            })
            .collect()
    }

    // The first tag set that matches any candidate wins. No tag sets means
    // every candidate matches.
    fn filter_by_tags<'a>(&self, candidates: Vec<&'a Arc<ServerInstance>>) -> Vec<&'a Arc<ServerInstance>> {
        if self.tag_sets.is_empty() {
            return candidates;
        }

        for tag_set in &self.tag_sets {
            let matched: Vec<_> = candidates.iter()
                .cloned()
                .filter(|instance| {
                    let tags = instance.tags();
                    tag_set.iter().all(|(k, v)| tags.get(k) == Some(v))
                })
                .collect();

            if !matched.is_empty() {
                return matched;
            }
        }

        Vec::new()
    }
}

impl ServerSelector for ReadPreference {
    fn choose(&self, instances: &[Arc<ServerInstance>]) -> Option<Arc<ServerInstance>> {
        let eligible = self.eligible(instances);
        choose_within_latency(&eligible, self.acceptable_latency)
    }
}

fn same_instance(a: &Arc<ServerInstance>, b: &Arc<ServerInstance>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Picks uniformly at random among the candidates whose average ping time is
/// within `window` of the fastest candidate.
pub fn choose_within_latency(candidates: &[&Arc<ServerInstance>], window: Duration) -> Option<Arc<ServerInstance>> {
    let pings: Vec<Duration> = candidates.iter().map(|i| i.average_ping_time()).collect();
    let fastest = match pings.iter().min() {
        Some(fastest) => *fastest,
        None => return None,
    };

    let in_window: Vec<&Arc<ServerInstance>> = match fastest.checked_add(window) {
        Some(limit) => candidates.iter()
            .zip(pings.iter())
            .filter(|&(_, ping)| *ping <= limit)
            .map(|(instance, _)| *instance)
            .collect(),
        None => candidates.to_vec(),
    };

    if in_window.is_empty() {
        return None;
    }

    let index = thread_rng().gen_range(0, in_window.len());
    Some(in_window[index].clone())
}

impl fmt::Display for ReadMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        fmt.write_str(name)
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{{ mode: {}", self.mode)?;
        if !self.tag_sets.is_empty() {
            write!(fmt, ", tags: {:?}", self.tag_sets)?;
        }
        fmt.write_str(" }")
    }
}
