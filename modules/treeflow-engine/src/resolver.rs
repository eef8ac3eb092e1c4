//! Dependency resolution: declared relative paths to node indices.
//!
//! A declared path is first anchored at the owning component, producing an
//! absolute segment list. That list is then walked from the root: named
//! segments select one child, wildcards fan out over all current children,
//! and the final segment selects a property. Every node reached becomes a
//! dependency, remembered together with the concrete path (wildcards
//! replaced by the child ids actually matched) used in reasons.

use std::collections::BTreeSet;

use tracing::debug;

use crate::arena::{Arena, ComponentSlot};
use crate::types::{NodeIndex, Path, RelativePath, Segment};

/// A declared dependency anchored at its owning component.
#[derive(Debug, Clone)]
pub(crate) struct Dependency {
    pub(crate) declared: RelativePath,
    /// `None` when the path climbs above the root.
    absolute: Option<Vec<Segment>>,
    /// Leading absolute segments taken from the owner's path.
    base_len: usize,
    /// Leading declared segments consumed by anchoring (`this` or `_`s).
    marker_len: usize,
}

impl Dependency {
    pub(crate) fn new(component_path: &Path, declared: &RelativePath) -> Self {
        let segments = declared.segments();
        let owner: Vec<Segment> = component_path.iter().cloned().map(Segment::Key).collect();

        let (base_len, marker_len) = match segments.first() {
            Some(Segment::This) => (Some(owner.len()), 1),
            Some(Segment::Up) => {
                let ups = segments.iter().take_while(|s| matches!(s, Segment::Up)).count();
                (owner.len().checked_sub(ups + 1), ups)
            }
            _ => (owner.len().checked_sub(1), 0),
        };

        let absolute = base_len.filter(|&n| n > 0).map(|n| {
            let mut absolute = owner[..n].to_vec();
            absolute.extend(segments[marker_len..].iter().cloned());
            absolute
        });

        Self {
            declared: declared.clone(),
            base_len: base_len.unwrap_or(0),
            absolute,
            marker_len,
        }
    }

    pub(crate) fn is_ambiguous(&self) -> bool {
        self.declared.is_ambiguous()
    }

    /// False when anchoring leaves nothing to walk.
    fn is_walkable(&self) -> bool {
        self.absolute.as_ref().is_some_and(|a| a.len() >= 2)
    }

    /// Walk the current tree and report every node this dependency reaches.
    pub(crate) fn walk<F>(&self, arena: &Arena, mut visit: F)
    where
        F: FnMut(NodeIndex, RelativePath),
    {
        // A lone root segment names no property.
        let Some(absolute) = self.absolute.as_deref().filter(|a| a.len() >= 2) else {
            return;
        };
        let Some(root) = arena.root().and_then(|uid| arena.component(uid)) else {
            return;
        };

        let mut concrete = self.declared.segments()[..self.marker_len].to_vec();
        let mut walk = Walk {
            arena,
            absolute,
            base_len: self.base_len,
            concrete: &mut concrete,
            visit: &mut visit,
        };
        walk.step(root, 1);
    }
}

struct Walk<'a, F> {
    arena: &'a Arena,
    absolute: &'a [Segment],
    base_len: usize,
    concrete: &'a mut Vec<Segment>,
    visit: &'a mut F,
}

impl<F: FnMut(NodeIndex, RelativePath)> Walk<'_, F> {
    fn step(&mut self, component: &ComponentSlot, pos: usize) {
        let (arena, absolute) = (self.arena, self.absolute);
        let segment = &absolute[pos];
        let in_rest = pos >= self.base_len;

        if pos == absolute.len() - 1 {
            let Segment::Key(property) = segment else {
                return;
            };
            if let Some(&index) = component.properties.get(property) {
                if in_rest {
                    self.concrete.push(segment.clone());
                }
                (self.visit)(index, RelativePath::new(self.concrete.clone()));
                if in_rest {
                    self.concrete.pop();
                }
            }
            return;
        }

        match segment {
            Segment::Wildcard => {
                for &child in &component.children {
                    let Some(slot) = arena.component(child) else {
                        continue;
                    };
                    let Some(id) = slot.path.last() else {
                        continue;
                    };
                    self.descend(slot, Segment::Key(id.clone()), in_rest, pos);
                }
            }
            Segment::Key(id) => {
                let child = component.child_ids.get(id).and_then(|&uid| arena.component(uid));
                if let Some(slot) = child {
                    self.descend(slot, segment.clone(), in_rest, pos);
                }
            }
            // Anchoring markers only appear at the head of a declared path.
            Segment::This | Segment::Up => {}
        }
    }

    fn descend(&mut self, slot: &ComponentSlot, segment: Segment, in_rest: bool, pos: usize) {
        if in_rest {
            self.concrete.push(segment);
        }
        self.step(slot, pos + 1);
        if in_rest {
            self.concrete.pop();
        }
    }
}

/// All nodes `declared` reaches from a component at `component_path`, with
/// the concrete path under which each is reached.
pub(crate) fn resolve_path(
    arena: &Arena,
    component_path: &Path,
    declared: &RelativePath,
) -> Vec<(NodeIndex, RelativePath)> {
    let mut found = Vec::new();
    Dependency::new(component_path, declared).walk(arena, |index, concrete| found.push((index, concrete)));
    found
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

struct Link {
    target: NodeIndex,
    declared: RelativePath,
    concrete: RelativePath,
}

/// Walk every declared dependency of `node`. The flag reports whether some
/// named (wildcard-free) dependency that can be anchored matched nothing.
fn resolve_node(arena: &Arena, node: NodeIndex) -> (Vec<Link>, bool) {
    let mut links = Vec::new();
    let mut dangling = false;
    let Some(n) = arena.node(node) else {
        return (links, dangling);
    };

    for dependency in &n.declared {
        let before = links.len();
        dependency.walk(arena, |target, concrete| {
            links.push(Link {
                target,
                declared: dependency.declared.clone(),
                concrete,
            })
        });
        if links.len() == before && dependency.is_walkable() && !dependency.is_ambiguous() {
            dangling = true;
        }
    }
    (links, dangling)
}

fn register(arena: &mut Arena, node: NodeIndex, links: Vec<Link>) -> usize {
    let mut added = 0;
    for link in links {
        let known = arena
            .node(node)
            .is_some_and(|n| n.dependencies.contains_key(&link.target));
        if known {
            continue;
        }
        if let Some(target) = arena.node_mut(link.target) {
            target.dependents.insert(node, link.concrete);
        } else {
            continue;
        }
        if let Some(source) = arena.node_mut(node) {
            source.dependencies.insert(link.target, link.declared);
        }
        added += 1;
    }
    added
}

fn link_node(arena: &mut Arena, node: NodeIndex) -> usize {
    let (links, dangling) = resolve_node(arena, node);
    if dangling {
        arena.dangling.insert(node);
    } else {
        arena.dangling.remove(&node);
    }
    register(arena, node, links)
}

/// Resolve and register dependencies of every node in `nodes`.
pub(crate) fn link_nodes(arena: &mut Arena, nodes: &[NodeIndex]) -> usize {
    nodes.iter().map(|&node| link_node(arena, node)).sum()
}

/// Re-walk every ambiguous or dangling node after the tree gained
/// components. Only newly reachable dependencies are registered.
pub(crate) fn rewalk(arena: &mut Arena) -> usize {
    let candidates: BTreeSet<NodeIndex> = arena.ambiguous.union(&arena.dangling).copied().collect();
    let linked: usize = candidates.into_iter().map(|node| link_node(arena, node)).sum();
    if linked > 0 {
        debug!(linked, "Re-walk registered new dependencies");
    }
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PropertyDescriptor;
    use crate::types::{key, ComponentUid};
    use serde_json::Value;

    fn rel(segments: &[&str]) -> RelativePath {
        RelativePath::parse(segments)
    }

    fn add(arena: &mut Arena, parent: Option<ComponentUid>, path: &str, props: &[&str]) -> ComponentUid {
        let path = Path::parse(path);
        let id = path.last().cloned();
        let uid = arena.add_component(parent, path);
        for prop in props {
            arena
                .add_node(uid, PropertyDescriptor::passive(key(prop), Value::Null))
                .unwrap();
        }
        if let (Some(parent), Some(id)) = (parent, id) {
            arena.attach_child(parent, id, uid);
        }
        uid
    }

    fn tree() -> Arena {
        let mut arena = Arena::new();
        let root = add(&mut arena, None, "root", &["x"]);
        let panel = add(&mut arena, Some(root), "root/panel", &["x"]);
        add(&mut arena, Some(panel), "root/panel/a", &["v"]);
        add(&mut arena, Some(panel), "root/panel/b", &["v"]);
        arena
    }

    fn target(arena: &Arena, path: &str) -> NodeIndex {
        arena.node_index(&Path::parse(path)).unwrap()
    }

    #[test]
    fn this_anchors_at_owner() {
        let arena = tree();
        let found = resolve_path(&arena, &Path::parse("root/panel"), &rel(&["this", "a", "v"]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, target(&arena, "root/panel/a/v"));
        assert_eq!(found[0].1.to_string(), "[this a v]");
    }

    #[test]
    fn plain_path_anchors_at_parent() {
        let arena = tree();
        let found = resolve_path(&arena, &Path::parse("root/panel/a"), &rel(&["b", "v"]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, target(&arena, "root/panel/b/v"));
    }

    #[test]
    fn up_climbs_above_parent() {
        let arena = tree();
        let found = resolve_path(&arena, &Path::parse("root/panel/a"), &rel(&["_", "x"]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, target(&arena, "root/x"));
        assert_eq!(found[0].1.to_string(), "[_ x]");
    }

    #[test]
    fn wildcard_matches_every_child_with_concrete_ids() {
        let arena = tree();
        let found = resolve_path(&arena, &Path::parse("root/panel"), &rel(&["this", "*", "v"]));
        let mut concrete: Vec<String> = found.iter().map(|(_, p)| p.to_string()).collect();
        concrete.sort();
        assert_eq!(concrete, vec!["[this a v]", "[this b v]"]);
    }

    #[test]
    fn escaping_above_root_resolves_to_nothing() {
        let arena = tree();
        assert!(resolve_path(&arena, &Path::parse("root/panel"), &rel(&["_", "x"])).is_empty());
        assert!(resolve_path(&arena, &Path::parse("root"), &rel(&["x"])).is_empty());
    }

    #[test]
    fn missing_named_segment_is_dangling_until_rewalked() {
        let mut arena = Arena::new();
        let root = add(&mut arena, None, "root", &[]);
        let owner = arena.add_component(Some(root), Path::parse("root/a"));
        arena.attach_child(root, key("a"), owner);
        let node = arena
            .add_node(
                owner,
                PropertyDescriptor::passive(key("y"), Value::Null).with_dependencies(vec![rel(&["b", "x"])]),
            )
            .unwrap();

        assert_eq!(link_nodes(&mut arena, &[node]), 0);
        assert!(arena.dangling.contains(&node));

        let b = add(&mut arena, Some(root), "root/b", &["x"]);
        assert_eq!(rewalk(&mut arena), 1);
        assert!(!arena.dangling.contains(&node));

        let x = arena.nodes_of(b)[0];
        assert!(arena.node(x).unwrap().dependents.contains_key(&node));
    }
}
