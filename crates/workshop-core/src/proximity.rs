//! Distance and neighbor queries over agent positions
//!
//! Pure functions of the current instance map; an unknown id yields
//! `None` or an empty result.

use crate::model::AgentInstance;
use std::collections::BTreeMap;

pub type InstanceMap = BTreeMap<String, AgentInstance>;

/// Distance between two instances, `None` if either is missing
pub fn distance(instances: &InstanceMap, a: &str, b: &str) -> Option<f64> {
    let pa = instances.get(a)?.position;
    let pb = instances.get(b)?.position;
    Some(pa.distance_to(pb))
}

/// Ids of every other instance within `radius` of `instance_id`
pub fn find_nearby(instances: &InstanceMap, instance_id: &str, radius: f64) -> Vec<String> {
    let Some(origin) = instances.get(instance_id).map(|i| i.position) else {
        return Vec::new();
    };
    instances
        .values()
        .filter(|other| other.instance_id != instance_id)
        .filter(|other| origin.distance_to(other.position) <= radius)
        .map(|other| other.instance_id.clone())
        .collect()
}

/// Every unordered pair within `radius`, each reported once
pub fn all_pairs_within(instances: &InstanceMap, radius: f64) -> Vec<(String, String, f64)> {
    let list: Vec<&AgentInstance> = instances.values().collect();
    let mut pairs = Vec::new();
    for i in 0..list.len() {
        for j in (i + 1)..list.len() {
            let d = list[i].position.distance_to(list[j].position);
            if d <= radius {
                pairs.push((list[i].instance_id.clone(), list[j].instance_id.clone(), d));
            }
        }
    }
    pairs
}

/// True if `a` and `b` both exist and are within `radius` of each other
pub fn within(instances: &InstanceMap, a: &str, b: &str, radius: f64) -> bool {
    distance(instances, a, b).is_some_and(|d| d <= radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Behavior;
    use workshop_common::Position;

    fn place(map: &mut InstanceMap, id: &str, x: f64, y: f64) {
        let mut inst = AgentInstance::new(format!("agent-{}", id), Position::new(x, y), Behavior::Stationary);
        inst.instance_id = id.to_string();
        map.insert(id.to_string(), inst);
    }

    #[test]
    fn test_distance_missing_instance() {
        let mut map = InstanceMap::new();
        place(&mut map, "a", 0.0, 0.0);
        assert_eq!(distance(&map, "a", "ghost"), None);
        assert_eq!(distance(&map, "a", "a"), Some(0.0));
    }

    #[test]
    fn test_find_nearby_excludes_self() {
        let mut map = InstanceMap::new();
        place(&mut map, "a", 0.0, 0.0);
        place(&mut map, "b", 100.0, 0.0);
        place(&mut map, "c", 500.0, 0.0);

        let nearby = find_nearby(&map, "a", 150.0);
        assert_eq!(nearby, vec!["b".to_string()]);
        assert!(find_nearby(&map, "ghost", 150.0).is_empty());
    }

    #[test]
    fn test_all_pairs_reports_each_pair_once() {
        let mut map = InstanceMap::new();
        place(&mut map, "a", 0.0, 0.0);
        place(&mut map, "b", 10.0, 0.0);
        place(&mut map, "c", 20.0, 0.0);

        let pairs = all_pairs_within(&map, 15.0);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(a, b, _)| a < b));

        let all = all_pairs_within(&map, 100.0);
        assert_eq!(all.len(), 3);
    }
}
