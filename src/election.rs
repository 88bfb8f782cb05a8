use std::{
    cmp::Ordering,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::cluster::{ClusterView, Server};

// Hash of the canonical peer URL. DefaultHasher uses fixed keys, so peers of
// the same build compute identical values without exchanging anything.
fn url_hash(url: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    hasher.finish()
}

// Smallest hash wins; equal hashes fall back to lexicographic URL order
fn candidate_cmp(a: (u64, &str), b: (u64, &str)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// Reelection is needed when there is no leader, the leader went offline, or
/// more than one server carries the leader flag.
pub fn should_reelect(view: &ClusterView) -> bool {
    let leaders: Vec<_> = view.servers().into_iter().filter(|x| x.leader).collect();

    match leaders.as_slice() {
        [] => true,
        [leader] => !leader.status,
        _ => true,
    }
}

/// Deterministic selection from the online peer set. Every peer observing the
/// same online set installs the same leader; an empty set clears the leader.
pub fn elect_leader(view: &ClusterView) -> Option<Arc<Server>> {
    let winner = view.online().into_iter().min_by(|a, b| {
        candidate_cmp(
            (url_hash(&a.url), a.url.as_str()),
            (url_hash(&b.url), b.url.as_str()),
        )
    });

    match &winner {
        Some(x) => view.set_leader(Some(&x.url)),
        None => view.set_leader(None),
    }

    winner
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use url::Url;

    use super::*;

    const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    fn view(urls: &[&str], my_url: &str) -> ClusterView {
        let list: Vec<Url> = urls.iter().map(|x| Url::parse(x).unwrap()).collect();
        ClusterView::new(&list, Some(&Url::parse(my_url).unwrap()), LOCAL_IP).unwrap()
    }

    #[test]
    fn test_election_deterministic() {
        let urls = ["http://a:1", "http://b:1", "http://c:1"];
        let expected = urls
            .iter()
            .copied()
            .min_by(|a, b| candidate_cmp((url_hash(a), *a), (url_hash(b), *b)))
            .unwrap();

        // Every peer, electing independently, installs the same leader
        for my_url in urls {
            let view = view(&urls, my_url);
            let winner = elect_leader(&view).unwrap();
            assert_eq!(winner.url, expected);
            assert_eq!(view.leader().unwrap().url, expected);
        }
    }

    #[test]
    fn test_election_skips_offline() {
        let urls = ["http://a:1", "http://b:1", "http://c:1"];
        let view = view(&urls, "http://a:1");

        let first = elect_leader(&view).unwrap();
        view.set_status(&first.url, false, None);

        let second = elect_leader(&view).unwrap();
        assert_ne!(second.url, first.url);

        let expected = urls
            .iter()
            .copied()
            .filter(|x| *x != first.url)
            .min_by(|a, b| candidate_cmp((url_hash(a), *a), (url_hash(b), *b)))
            .unwrap();
        assert_eq!(second.url, expected);
    }

    #[test]
    fn test_election_empty_online_set() {
        let view = view(&["http://a:1", "http://b:1"], "http://a:1");
        elect_leader(&view);

        view.set_status("http://a:1", false, None);
        view.set_status("http://b:1", false, None);

        assert!(elect_leader(&view).is_none());
        assert!(view.leader().is_none());
    }

    #[test]
    fn test_tie_broken_lexicographically() {
        // Hash ties are settled by URL order
        assert_eq!(
            candidate_cmp((7, "http://a:1"), (7, "http://b:1")),
            Ordering::Less
        );
        assert_eq!(
            candidate_cmp((7, "http://b:1"), (7, "http://a:1")),
            Ordering::Greater
        );
        // And only consulted on a tie
        assert_eq!(
            candidate_cmp((3, "http://z:1"), (7, "http://a:1")),
            Ordering::Less
        );
    }

    #[test]
    fn test_should_reelect() {
        let view = view(&["http://a:1", "http://b:1"], "http://a:1");

        // No leader yet
        assert!(should_reelect(&view));

        let leader = elect_leader(&view).unwrap();
        assert!(!should_reelect(&view));

        // Leader went offline
        view.set_status(&leader.url, false, None);
        assert!(should_reelect(&view));
        view.set_status(&leader.url, true, None);
        assert!(!should_reelect(&view));

        // Pathological double-leader state is repaired
        let other = view
            .servers()
            .into_iter()
            .find(|x| !x.leader)
            .unwrap();
        view.force_leader_flag(&other.url);
        assert!(should_reelect(&view));

        elect_leader(&view);
        let leaders = view.servers().into_iter().filter(|x| x.leader).count();
        assert_eq!(leaders, 1);
    }
}
