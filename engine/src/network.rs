//! Network generation (§15 — ambient, non-core): builds the user population
//! the pipeline runs over. Out of scope as a *pipeline* concern per §1, but
//! required for the crate to be runnable/testable standalone.
//!
//! Grounded in `original_source/libs/simsom/simtools.py::init_network`: a
//! directed random-walk growth model. `friends` are outgoing edges (who a
//! user follows, `graph.successors` in the original); `followers` are
//! incoming edges (`graph.predecessors`).

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use simsom_types::{generate_user_topics, Uid, User};

use crate::config::ValidatedNetworkConfig;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to read network file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse network file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// On-disk adjacency-list shape for a previously generated network — a
/// deliberate simplification over the original's igraph/GML loader (GML
/// parsing is out of scope; recorded in DESIGN.md). `friends[i]` lists who
/// node `i` follows.
#[derive(Debug, Serialize, Deserialize)]
pub struct AdjacencyList {
    pub friends: Vec<Vec<Uid>>,
}

/// Builds a directed follow graph of `net_size` nodes: seeds a clique of
/// `avg_n_friend` nodes, then grows it one node at a time. Each new node
/// follows a uniformly random existing target; with probability
/// `probability_follow` it also follows one of that target's own follows
/// (clustering), and any remaining edge budget is filled with uniformly
/// random follows.
pub fn generate_graph(
    net_size: usize,
    avg_n_friend: usize,
    probability_follow: f64,
    rng: &mut impl Rng,
) -> Vec<HashSet<Uid>> {
    let mut friends: Vec<HashSet<Uid>> = vec![HashSet::new(); net_size];
    let clique_size = avg_n_friend.clamp(1, net_size);

    for i in 0..clique_size {
        for j in 0..clique_size {
            if i != j {
                friends[i].insert(j as Uid);
            }
        }
    }

    for new_node in clique_size..net_size {
        let mut budget = avg_n_friend.min(new_node);
        if budget == 0 {
            continue;
        }

        let target = rng.gen_range(0..new_node);
        friends[new_node].insert(target as Uid);
        budget -= 1;

        if budget > 0 && rng.gen_bool(probability_follow) {
            if let Some(&successor) = friends[target].iter().choose(rng) {
                if successor as usize != new_node && friends[new_node].insert(successor) {
                    budget -= 1;
                }
            }
        }

        let mut misses = 0usize;
        while budget > 0 && misses < new_node * 4 {
            let candidate = rng.gen_range(0..new_node) as Uid;
            if candidate as usize != new_node && friends[new_node].insert(candidate) {
                budget -= 1;
            } else {
                misses += 1;
            }
        }
    }

    friends
}

fn followers_from_friends(friends: &[HashSet<Uid>]) -> Vec<HashSet<Uid>> {
    let mut followers = vec![HashSet::new(); friends.len()];
    for (uid, set) in friends.iter().enumerate() {
        for &friend in set {
            followers[friend as usize].insert(uid as Uid);
        }
    }
    followers
}

fn load_from_file(path: &Path) -> Result<Vec<HashSet<Uid>>, NetworkError> {
    let raw = fs::read_to_string(path).map_err(|source| NetworkError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let adjacency: AdjacencyList =
        serde_json::from_str(&raw).map_err(|source| NetworkError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    Ok(adjacency
        .friends
        .into_iter()
        .map(|list| list.into_iter().collect())
        .collect())
}

/// Builds the full `User` population: the friend/follower graph plus each
/// user's activity rate, sparse topic interests, and (absent) quality
/// params (authors fall back to `expon_quality` until a caller configures
/// per-author beta params).
pub fn build_population(
    config: &ValidatedNetworkConfig,
    n_topics: usize,
    mean_action_per_day_range: (f64, f64),
    rng: &mut impl Rng,
) -> Result<Vec<User>, NetworkError> {
    let friends = if config.from_file {
        let path = config
            .real_world_network
            .as_ref()
            .expect("validated config guarantees a path when from_file is set");
        load_from_file(path)?
    } else {
        generate_graph(
            config.net_size.get(),
            config.avg_n_friend,
            config.probability_follow,
            rng,
        )
    };
    let followers = followers_from_friends(&friends);

    let (lo, hi) = mean_action_per_day_range;
    let n_active_topics = (n_topics / 5).max(1);
    let users = friends
        .into_iter()
        .zip(followers)
        .enumerate()
        .map(|(uid, (friends, followers))| {
            let mean_action_per_day = if lo < hi { rng.gen_range(lo..hi) } else { lo };
            let topics = generate_user_topics(n_topics, n_active_topics, rng);
            User::new(
                uid as Uid,
                friends,
                followers,
                mean_action_per_day,
                topics,
                None,
            )
        })
        .collect();
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn every_non_seed_node_has_at_least_one_friend() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let friends = generate_graph(50, 5, 0.5, &mut rng);
        for (uid, set) in friends.iter().enumerate().skip(5) {
            assert!(!set.is_empty(), "node {uid} has no friends");
        }
    }

    #[test]
    fn followers_are_the_reverse_of_friends() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let friends = generate_graph(30, 4, 0.3, &mut rng);
        let followers = followers_from_friends(&friends);
        for (uid, set) in friends.iter().enumerate() {
            for &friend in set {
                assert!(followers[friend as usize].contains(&(uid as Uid)));
            }
        }
    }

    #[test]
    fn adjacency_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        let adjacency = AdjacencyList {
            friends: vec![vec![1, 2], vec![0], vec![0, 1]],
        };
        fs::write(&path, serde_json::to_string(&adjacency).unwrap()).unwrap();
        let loaded = load_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded[0].contains(&1));
        assert!(loaded[0].contains(&2));
    }
}
