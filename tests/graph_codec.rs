// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use hashtree::core::graph::{
    from_binary, to_binary, GraphCodecError, GraphEvent, SerializeOptions, SocialGraph,
};

fn hex_user(n: u8) -> String {
    hex::encode([n; 32])
}

fn follow_event(author: &str, created_at: u64, targets: &[String]) -> GraphEvent {
    GraphEvent {
        pubkey: author.to_string(),
        created_at,
        kind: 3,
        tags: targets
            .iter()
            .map(|t| vec!["p".to_string(), t.clone()])
            .collect(),
    }
}

fn mute_event(author: &str, created_at: u64, targets: &[String]) -> GraphEvent {
    GraphEvent {
        pubkey: author.to_string(),
        created_at,
        kind: 10_000,
        tags: targets
            .iter()
            .map(|t| vec!["p".to_string(), t.clone()])
            .collect(),
    }
}

fn sample_graph() -> (String, SocialGraph) {
    let root = hex_user(0);
    let users: Vec<String> = (1..=5).map(hex_user).collect();
    let mut graph = SocialGraph::new(&root);
    graph.handle_event(
        &follow_event(&root, 100, &[users[0].clone(), users[1].clone()]),
        true,
        1,
    );
    graph.handle_event(
        &follow_event(&users[0], 110, &[users[2].clone(), users[3].clone()]),
        true,
        1,
    );
    graph.handle_event(&follow_event(&users[2], 120, &[users[4].clone()]), true, 1);
    graph.handle_event(&mute_event(&users[1], 130, &[users[3].clone()]), true, 1);
    (root, graph)
}

#[test]
fn binary_roundtrip_preserves_graph() {
    let (root, graph) = sample_graph();
    let bytes = to_binary(&graph, &SerializeOptions::default());
    let decoded = from_binary(&root, &bytes).unwrap();

    for a in (0..=5).map(hex_user) {
        for b in (0..=5).map(hex_user) {
            assert_eq!(
                decoded.is_following(&a, &b),
                graph.is_following(&a, &b),
                "follow {a} -> {b}"
            );
            assert_eq!(
                decoded.is_muting(&a, &b),
                graph.is_muting(&a, &b),
                "mute {a} -> {b}"
            );
        }
        assert_eq!(
            decoded.get_follow_distance(&a),
            graph.get_follow_distance(&a),
            "distance {a}"
        );
    }
    // Re-encoding the decoded graph is stable.
    let bytes2 = to_binary(&decoded, &SerializeOptions::default());
    let decoded2 = from_binary(&root, &bytes2).unwrap();
    assert_eq!(
        decoded2.get_users_by_follow_distance(1),
        decoded.get_users_by_follow_distance(1)
    );
}

#[test]
fn stale_events_after_roundtrip_are_still_stale() {
    let (root, graph) = sample_graph();
    let bytes = to_binary(&graph, &SerializeOptions::default());
    let mut decoded = from_binary(&root, &bytes).unwrap();
    // Timestamps survived, so an older list is still rejected.
    assert!(!decoded.handle_event(&follow_event(&root, 99, &[]), true, 1));
}

#[test]
fn max_edges_per_node_caps_outgoing_follows() {
    // 6 nodes, 11 edges.
    let root = hex_user(0);
    let users: Vec<String> = (1..=5).map(hex_user).collect();
    let mut graph = SocialGraph::new(&root);
    graph.handle_event(&follow_event(&root, 100, &users[0..3].to_vec()), true, 1);
    graph.handle_event(&follow_event(&users[0], 100, &[users[3].clone(), users[4].clone(), root.clone()]), true, 1);
    graph.handle_event(&follow_event(&users[1], 100, &[users[0].clone(), users[4].clone()]), true, 1);
    graph.handle_event(&follow_event(&users[3], 100, &[users[1].clone(), users[2].clone(), users[4].clone()]), true, 1);

    let uncapped = to_binary(&graph, &SerializeOptions::default());
    let capped = to_binary(
        &graph,
        &SerializeOptions {
            max_edges_per_node: Some(1),
            ..SerializeOptions::default()
        },
    );
    assert!(capped.len() < uncapped.len());

    let decoded = from_binary(&root, &capped).unwrap();
    for user in std::iter::once(root.clone()).chain(users.iter().cloned()) {
        assert!(
            decoded.get_followed_by_user(&user).len() <= 1,
            "{user} kept more than one outgoing follow"
        );
    }
}

#[test]
fn max_nodes_and_edges_are_respected() {
    let (root, graph) = sample_graph();
    let capped = to_binary(
        &graph,
        &SerializeOptions {
            max_nodes: Some(3),
            max_edges: Some(2),
            ..SerializeOptions::default()
        },
    );
    let decoded = from_binary(&root, &capped).unwrap();
    assert!(decoded.user_count() <= 3);
    let edge_count: usize = (0..=5)
        .map(hex_user)
        .map(|u| decoded.get_followed_by_user(&u).len() + decoded.get_muted_by_user(&u).len())
        .sum();
    assert!(edge_count <= 2);
}

#[test]
fn max_distance_drops_far_owners() {
    let (root, graph) = sample_graph();
    let capped = to_binary(
        &graph,
        &SerializeOptions {
            max_distance: Some(1),
            ..SerializeOptions::default()
        },
    );
    let decoded = from_binary(&root, &capped).unwrap();
    // hex_user(3) (distance 2) owns a follow list that must be gone.
    assert!(decoded.get_followed_by_user(&hex_user(3)).is_empty());
    // Root's own list (distance 0) survives.
    assert!(!decoded.get_followed_by_user(&root).is_empty());
}

#[test]
fn uncapped_is_superset_of_capped() {
    let (root, graph) = sample_graph();
    let uncapped = from_binary(&root, &to_binary(&graph, &SerializeOptions::default())).unwrap();
    let capped = from_binary(
        &root,
        &to_binary(
            &graph,
            &SerializeOptions {
                max_edges: Some(3),
                ..SerializeOptions::default()
            },
        ),
    )
    .unwrap();
    for a in (0..=5).map(hex_user) {
        for b in (0..=5).map(hex_user) {
            if capped.is_following(&a, &b) {
                assert!(uncapped.is_following(&a, &b));
            }
            if capped.is_muting(&a, &b) {
                assert!(uncapped.is_muting(&a, &b));
            }
        }
    }
}

#[test]
fn malformed_frames_fail_cleanly() {
    assert_eq!(
        from_binary(&hex_user(0), &[]),
        Err(GraphCodecError::Malformed)
    );
    assert_eq!(
        from_binary(&hex_user(0), &[9]),
        Err(GraphCodecError::UnsupportedVersion)
    );
    let (root, graph) = sample_graph();
    let mut bytes = to_binary(&graph, &SerializeOptions::default());
    bytes.truncate(bytes.len() - 1);
    assert!(from_binary(&root, &bytes).is_err());
}
