//! Platform resolution over many label sets.

use kiln_core::job::{Job, Placement, Step};
use kiln_core::config::EngineConfig;
use kiln_platform::{PlatformResolver, TemplateSource};
use kiln_tests::{PlatformFixture, TestContext};
use pretty_assertions::assert_eq;

const POOL: &[&str] = &[
    "ubuntu-latest",
    "self-hosted",
    "gpu",
    "linux",
    "arm64",
    "large",
    "windows",
    "team-infra",
];

/// Every ordering of `labels`.
fn permutations(labels: &[&'static str]) -> Vec<Vec<&'static str>> {
    if labels.len() <= 1 {
        return vec![labels.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..labels.len() {
        let mut rest = labels.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}

/// Every subset of `POOL` with at most `max` labels.
fn subsets(max: usize) -> Vec<Vec<&'static str>> {
    let mut out = Vec::new();
    for mask in 0u32..(1 << POOL.len()) {
        if mask.count_ones() as usize > max {
            continue;
        }
        out.push(
            POOL.iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, l)| *l)
                .collect(),
        );
    }
    out
}

#[test]
fn test_order_independent_for_every_small_subset() {
    let resolver = PlatformResolver::new(PlatformFixture::table()).unwrap();

    for subset in subsets(3) {
        let expected = resolver.resolve(&Placement::new(subset.iter().copied()));
        for order in permutations(&subset) {
            let template = resolver.resolve(&Placement::new(order.iter().copied()));
            assert_eq!(template, expected, "labels {:?}", order);
        }
    }
}

#[test]
fn test_total_for_hostile_labels() {
    let resolver = PlatformResolver::new(PlatformFixture::table()).unwrap();
    let long = "x".repeat(300);
    let hostile: Vec<Vec<String>> = vec![
        vec![String::new()],
        vec!["   ".to_string(), "\t".to_string()],
        vec!["ÜBUNTU".to_string(), "gpu/α".to_string()],
        vec![long.clone(), format!("{}-2", long)],
        vec!["--".to_string(), "..".to_string(), "__".to_string()],
        vec!["Self-Hosted".to_string(), "GPU".to_string(), "self-hosted ".to_string()],
    ];

    for labels in hostile {
        let placement = Placement::new(labels.clone());
        let first = resolver.resolve(&placement);
        let second = resolver.resolve(&placement);
        assert_eq!(first, second, "labels {:?}", labels);
        assert!(!first.image.is_empty());
        for key in first.node_selector.keys() {
            assert!(!key.is_empty());
        }
    }
}

#[test]
fn test_exact_entry_wins_over_composition() {
    let resolver = PlatformResolver::new(PlatformFixture::table()).unwrap();

    let exact = resolver.resolve(&Placement::new(["gpu", "self-hosted"]));
    assert_eq!(exact.source, TemplateSource::Exact);
    assert_eq!(exact.name, "gpu-pool");
    assert_eq!(exact.image, "ghcr.io/kiln/runner-cuda:12");

    let composed = resolver.resolve(&Placement::new(["gpu", "self-hosted", "linux"]));
    assert_eq!(composed.source, TemplateSource::Composed);
    assert!(!composed.node_selector.contains_key("pool"));
}

#[test]
fn test_case_and_duplicates_normalised() {
    let resolver = PlatformResolver::new(PlatformFixture::table()).unwrap();

    let a = resolver.resolve(&Placement::new(["Ubuntu-Latest"]));
    let b = resolver.resolve(&Placement::new(["ubuntu-latest", "ubuntu-latest"]));
    assert_eq!(a, b);
    assert_eq!(a.image, "ghcr.io/kiln/runner-ubuntu:24.04");
}

#[tokio::test(start_paused = true)]
async fn test_resolved_template_reaches_the_sandbox() {
    let config = EngineConfig {
        platforms: PlatformFixture::table(),
        ..EngineConfig::default()
    };
    let ctx = TestContext::with_config(config);
    let job = Job::new("gpu-train")
        .with_labels(["self-hosted", "gpu"])
        .with_step(Step::run("train", "echo training"));

    ctx.run_job(job).await;

    let spec = &ctx.cluster.created_specs()[0];
    assert_eq!(spec.primary.image, "ghcr.io/kiln/runner-cuda:12");
    assert_eq!(spec.node_selector.get("pool").map(String::as_str), Some("gpu"));
    ctx.assert_no_sandboxes_left();
}
