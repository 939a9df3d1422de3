// Property-based tests for per-domain fairness of worker queues

use jobs_core::broker::FairQueue;
use jobs_core::models::{Job, JobOptions, JobRequest};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

fn job(domain: &str, seq: usize) -> Job {
    Job::from_request(
        JobRequest::new(domain, "mail", json!({ "seq": seq })),
        JobOptions::default(),
    )
}

/// Within one domain, jobs come out in push order
#[test]
fn property_fifo_within_domain() {
    proptest!(|(pushes in prop::collection::vec(0usize..4usize, 1..60))| {
        let queue = FairQueue::new();
        for (seq, domain) in pushes.iter().enumerate() {
            queue.push(job(&format!("d{}", domain), seq));
        }

        let mut last_seen: HashMap<String, u64> = HashMap::new();
        let mut popped = 0;
        while let Some(job) = queue.try_pop() {
            let seq = job.message["seq"].as_u64().unwrap();
            if let Some(previous) = last_seen.insert(job.domain.clone(), seq) {
                prop_assert!(seq > previous);
            }
            popped += 1;
        }
        prop_assert_eq!(popped, pushes.len());
        prop_assert!(queue.is_empty());
    });
}

/// A domain with a large backlog cannot delay another domain by more than one turn
/// per competing domain
#[test]
fn property_busy_domain_cannot_starve_others() {
    proptest!(|(backlog in 1usize..50usize, others in 1usize..5usize)| {
        let queue = FairQueue::new();
        for seq in 0..backlog {
            queue.push(job("busy.example.net", seq));
        }
        for n in 0..others {
            queue.push(job(&format!("quiet{}.example.net", n), n));
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|job| job.domain)
            .collect();

        // Every quiet domain is served within the first round
        for n in 0..others {
            let name = format!("quiet{}.example.net", n);
            let position = order.iter().position(|d| *d == name).unwrap();
            prop_assert!(position <= others, "{} served at {}", name, position);
        }
        prop_assert_eq!(order.len(), backlog + others);
    });
}
