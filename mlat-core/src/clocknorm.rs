//! Clock normalization: given several receivers' timestamps for the same
//! events, rewrite them all onto one arbitrary common timescale so a
//! solver can treat them as directly comparable.
//!
//! Receivers form a weighted graph, with an edge wherever a usable
//! [`ClockPair`] (or a shared clock epoch) lets one receiver's
//! timestamps be predicted from another's; edge weight is the variance
//! that conversion introduces. For each connected component, we take its
//! minimum spanning tree (the lowest-total-error way to relate every
//! receiver to every other) and pick a central node — the one that
//! minimizes the worst-case path cost to any other node in the tree —
//! then walk the tree converting every receiver's timestamps onto the
//! central node's clock, finally scaling to wall-clock seconds.

use std::collections::{HashMap, HashSet};

use crate::clock::Epoch;
use crate::clockpair::ClockPair;
use crate::receiver::{Receiver, ReceiverId};

/// One observation: a receiver clock timestamp and the wall-clock UTC
/// time it was recorded against (kept along for the ride, unconverted).
#[derive(Debug, Clone, Copy)]
pub struct TimestampSample {
    pub timestamp: f64,
    pub utc: f64,
}

#[derive(Clone, Copy)]
enum EdgeKind {
    Identity,
    /// `base < peer` always, matching the [`ClockPair`] map key. `reverse`
    /// selects which direction of the pairing this edge predicts:
    /// `false` predicts `peer` given `base` (`predict_peer`), `true`
    /// predicts `base` given `peer` (`predict_base`).
    Pair {
        base: ReceiverId,
        peer: ReceiverId,
        reverse: bool,
    },
}

#[derive(Clone, Copy)]
struct Edge {
    kind: EdgeKind,
    variance: f64,
}

impl Edge {
    fn predict(&self, clock_pairs: &HashMap<(ReceiverId, ReceiverId), ClockPair>, ts: f64) -> Option<f64> {
        match self.kind {
            EdgeKind::Identity => Some(ts),
            EdgeKind::Pair { base, peer, reverse } => {
                let pair = clock_pairs.get(&(base, peer))?;
                if reverse {
                    pair.predict_base(ts)
                } else {
                    pair.predict_peer(ts)
                }
            }
        }
    }
}

fn pair_key(a: ReceiverId, b: ReceiverId) -> (ReceiverId, ReceiverId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Build the (a -> b, b -> a) predictor pair for `a`/`b`, or `None` if no
/// usable clock relationship exists between them yet.
fn make_predictors(
    receivers: &HashMap<ReceiverId, Receiver>,
    clock_pairs: &HashMap<(ReceiverId, ReceiverId), ClockPair>,
    a: ReceiverId,
    b: ReceiverId,
) -> Option<(Edge, Edge)> {
    if a == b {
        return None;
    }
    let (ra, rb) = (receivers.get(&a)?, receivers.get(&b)?);

    if ra.clock.epoch != Epoch::None && ra.clock.epoch == rb.clock.epoch {
        let variance = ra.clock.jitter * ra.clock.jitter + rb.clock.jitter * rb.clock.jitter;
        let edge = Edge {
            kind: EdgeKind::Identity,
            variance,
        };
        return Some((edge, edge));
    }

    let (base, peer) = pair_key(a, b);
    let pair = clock_pairs.get(&(base, peer))?;
    if !pair.valid() {
        return None;
    }
    let variance = pair.error() * pair.error();

    let a_to_b = Edge {
        kind: EdgeKind::Pair {
            base,
            peer,
            reverse: a == peer,
        },
        variance,
    };
    let b_to_a = Edge {
        kind: EdgeKind::Pair {
            base,
            peer,
            reverse: b == peer,
        },
        variance,
    };
    Some((a_to_b, b_to_a))
}

type Adjacency = HashMap<ReceiverId, Vec<(ReceiverId, f64)>>;

fn connected_components(nodes: &[ReceiverId], adj: &Adjacency) -> Vec<Vec<ReceiverId>> {
    let mut seen = HashSet::new();
    let mut components = Vec::new();
    for &start in nodes {
        if seen.contains(&start) {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        seen.insert(start);
        while let Some(node) = stack.pop() {
            component.push(node);
            for &(nbr, _) in adj.get(&node).map(|v| v.as_slice()).unwrap_or(&[]) {
                if seen.insert(nbr) {
                    stack.push(nbr);
                }
            }
        }
        components.push(component);
    }
    components
}

/// Prim's algorithm, O(n^2) — fine for the receiver-count-per-aircraft
/// scale this runs at.
fn minimum_spanning_tree(component: &[ReceiverId], adj: &Adjacency) -> Adjacency {
    let mut tree: Adjacency = HashMap::new();
    if component.is_empty() {
        return tree;
    }
    let mut in_tree: HashSet<ReceiverId> = HashSet::new();
    in_tree.insert(component[0]);
    tree.entry(component[0]).or_default();

    while in_tree.len() < component.len() {
        let mut best: Option<(ReceiverId, ReceiverId, f64)> = None;
        for &u in &in_tree {
            for &(v, w) in adj.get(&u).map(|x| x.as_slice()).unwrap_or(&[]) {
                if in_tree.contains(&v) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, _, bw)) => w < bw,
                };
                if better {
                    best = Some((u, v, w));
                }
            }
        }
        let Some((u, v, w)) = best else {
            break; // disconnected; shouldn't happen within one component
        };
        tree.entry(u).or_default().push((v, w));
        tree.entry(v).or_default().push((u, w));
        in_tree.insert(v);
    }
    tree
}

fn label_heights(tree: &Adjacency, node: ReceiverId, heights: &mut HashMap<ReceiverId, f64>) {
    heights.insert(node, 0.0);
    let neighbors = tree.get(&node).cloned().unwrap_or_default();
    for (nbr, w) in neighbors {
        if !heights.contains_key(&nbr) {
            label_heights(tree, nbr, heights);
            let candidate = heights[&nbr] + w;
            if candidate > heights[&node] {
                heights.insert(node, candidate);
            }
        }
    }
}

fn tallest_branch(
    tree: &Adjacency,
    node: ReceiverId,
    heights: &HashMap<ReceiverId, f64>,
    ignore: Option<ReceiverId>,
) -> (f64, Option<ReceiverId>) {
    let mut tallest = (0.0, None);
    for &(nbr, w) in tree.get(&node).map(|v| v.as_slice()).unwrap_or(&[]) {
        if Some(nbr) == ignore {
            continue;
        }
        let h = heights[&nbr] + w;
        if h > tallest.0 {
            tallest = (h, Some(nbr));
        }
    }
    tallest
}

fn find_central(tree: &Adjacency, root: ReceiverId) -> ReceiverId {
    let mut heights = HashMap::new();
    label_heights(tree, root, &mut heights);

    let tall1 = tallest_branch(tree, root, &heights, None);
    let tall2 = tallest_branch(tree, root, &heights, tall1.1);
    let target = (tall1.0 + tall2.0) / 2.0;

    let mut central = root;
    let mut step = tall1.1;
    while let Some(s) = step {
        if (heights[&central] - target).abs() <= (heights[&s] - target).abs() {
            break;
        }
        central = s;
        step = tallest_branch(tree, central, &heights, Some(central)).1;
    }
    central
}

fn convert_timestamps(
    tree: &Adjacency,
    timestamp_map: &HashMap<ReceiverId, Vec<TimestampSample>>,
    predictor_map: &HashMap<(ReceiverId, ReceiverId), Edge>,
    clock_pairs: &HashMap<(ReceiverId, ReceiverId), ClockPair>,
    node: ReceiverId,
    results: &mut HashMap<ReceiverId, (f64, Vec<TimestampSample>)>,
    chain: &[Edge],
    variance: f64,
) {
    let mut converted = Vec::new();
    if let Some(samples) = timestamp_map.get(&node) {
        for sample in samples {
            let mut ts = sample.timestamp;
            let mut ok = true;
            for edge in chain {
                match edge.predict(clock_pairs, ts) {
                    Some(v) => ts = v,
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                converted.push(TimestampSample {
                    timestamp: ts,
                    utc: sample.utc,
                });
            }
        }
    }
    results.insert(node, (variance, converted));

    let neighbors = tree.get(&node).cloned().unwrap_or_default();
    for (neighbor, _) in neighbors {
        if results.contains_key(&neighbor) {
            continue;
        }
        let Some(&edge) = predictor_map.get(&(neighbor, node)) else {
            continue;
        };
        let mut new_chain = vec![edge];
        new_chain.extend_from_slice(chain);
        convert_timestamps(
            tree,
            timestamp_map,
            predictor_map,
            clock_pairs,
            neighbor,
            results,
            &new_chain,
            variance + edge.variance,
        );
    }
}

/// Normalize `timestamp_map` (receiver -> its raw timestamp samples) onto
/// one timescale per connected component. Each returned map is
/// `receiver -> (variance introduced, converted samples)`.
pub fn normalize(
    receivers: &HashMap<ReceiverId, Receiver>,
    clock_pairs: &HashMap<(ReceiverId, ReceiverId), ClockPair>,
    timestamp_map: &HashMap<ReceiverId, Vec<TimestampSample>>,
) -> Vec<HashMap<ReceiverId, (f64, Vec<TimestampSample>)>> {
    let nodes: Vec<ReceiverId> = timestamp_map.keys().copied().collect();

    let mut adj: Adjacency = HashMap::new();
    let mut predictor_map: HashMap<(ReceiverId, ReceiverId), Edge> = HashMap::new();

    for (i, &a) in nodes.iter().enumerate() {
        for &b in &nodes[i + 1..] {
            if let Some((ab, ba)) = make_predictors(receivers, clock_pairs, a, b) {
                adj.entry(a).or_default().push((b, ab.variance));
                adj.entry(b).or_default().push((a, ab.variance));
                predictor_map.insert((a, b), ab);
                predictor_map.insert((b, a), ba);
            }
        }
    }

    let mut out = Vec::new();
    for component in connected_components(&nodes, &adj) {
        if component.is_empty() {
            continue;
        }
        let tree = minimum_spanning_tree(&component, &adj);
        let root = component[0];
        let central = find_central(&tree, root);

        let Some(central_receiver) = receivers.get(&central) else {
            continue;
        };
        let scale_variance = central_receiver.clock.jitter * central_receiver.clock.jitter;
        let freq = central_receiver.clock.freq;
        let scale_edge = Edge {
            kind: EdgeKind::Identity,
            variance: 0.0,
        };
        // The root conversion chain divides by the central clock's
        // frequency to land in wall-clock seconds; represent that as a
        // one-off closure-free step applied after the identity edge by
        // post-scaling rather than folding it into the Edge enum.
        let mut results = HashMap::new();
        convert_timestamps(
            &tree,
            timestamp_map,
            &predictor_map,
            clock_pairs,
            central,
            &mut results,
            &[scale_edge],
            scale_variance,
        );
        for (_, (_, samples)) in results.iter_mut() {
            for s in samples.iter_mut() {
                s.timestamp /= freq;
            }
        }
        out.push(results);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use uuid::Uuid;

    fn recv_id(n: u8) -> ReceiverId {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        ReceiverId(Uuid::from_bytes(bytes))
    }

    fn recv(n: u8, clock_type: &str) -> (ReceiverId, Receiver) {
        let id = recv_id(n);
        (
            id,
            Receiver::new(
                id,
                format!("r{n}"),
                (0.0, 0.0, 0.0),
                Clock::from_type(clock_type).unwrap(),
                false,
            ),
        )
    }

    #[test]
    fn single_receiver_normalizes_trivially() {
        let (id, r) = recv(1, "beast");
        let mut receivers = HashMap::new();
        receivers.insert(id, r);
        let clock_pairs = HashMap::new();

        let mut ts_map = HashMap::new();
        ts_map.insert(
            id,
            vec![TimestampSample {
                timestamp: 120_000.0,
                utc: 1.0,
            }],
        );

        let components = normalize(&receivers, &clock_pairs, &ts_map);
        assert_eq!(components.len(), 1);
        let (_, samples) = &components[0][&id];
        assert!((samples[0].timestamp - 0.01).abs() < 1e-9);
    }

    #[test]
    fn gps_epoch_receivers_use_identity_predictor() {
        let (id1, r1) = recv(1, "radarcape_gps");
        let (id2, r2) = recv(2, "radarcape_gps");
        let mut receivers = HashMap::new();
        receivers.insert(id1, r1);
        receivers.insert(id2, r2);
        let clock_pairs = HashMap::new();

        let mut ts_map = HashMap::new();
        ts_map.insert(
            id1,
            vec![TimestampSample {
                timestamp: 1_000_000_000.0,
                utc: 1.0,
            }],
        );
        ts_map.insert(
            id2,
            vec![TimestampSample {
                timestamp: 1_000_000_000.0,
                utc: 1.0,
            }],
        );

        let components = normalize(&receivers, &clock_pairs, &ts_map);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), 2);
    }

    #[test]
    fn disjoint_receivers_form_separate_components() {
        let (id1, r1) = recv(1, "beast");
        let (id2, r2) = recv(2, "sbs");
        let mut receivers = HashMap::new();
        receivers.insert(id1, r1);
        receivers.insert(id2, r2);
        let clock_pairs = HashMap::new();

        let mut ts_map = HashMap::new();
        ts_map.insert(
            id1,
            vec![TimestampSample {
                timestamp: 0.0,
                utc: 1.0,
            }],
        );
        ts_map.insert(
            id2,
            vec![TimestampSample {
                timestamp: 0.0,
                utc: 1.0,
            }],
        );

        let components = normalize(&receivers, &clock_pairs, &ts_map);
        assert_eq!(components.len(), 2);
    }
}
