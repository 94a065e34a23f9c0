//! Inventory resolution.
//!
//! Two lookup styles are supported:
//!
//! - flat scans over a container view ([`find_by_name`]) for datacenters,
//!   clusters, hosts and templates;
//! - depth-first search over an [`InventoryNode`] snapshot ([`find_folder`],
//!   [`resolve_folder_path`]) for folders nested at arbitrary depth.
//!
//! Names are not unique. In both styles the first match wins: listing order
//! for flat scans, pre-order traversal for tree searches. Which duplicate a
//! backend lists first is up to the backend.

use tracing::debug;

use crate::error::CloneError;
use crate::platform::{ControlPlane, InventoryNode, PlatformError, ResourceKind, ResourceRef};

/// First object of `kind` named `name` below `scope` (recursive), or `None`.
///
/// # Errors
/// Propagates control-plane failures; absence is not an error.
pub async fn find_by_name<P: ControlPlane + ?Sized>(
    plane: &P,
    scope: Option<&ResourceRef>,
    kind: ResourceKind,
    name: &str,
) -> Result<Option<ResourceRef>, PlatformError> {
    let view = plane.container_view(scope, &[kind], true).await?;
    debug!(%kind, name, candidates = view.len(), "Scanning container view");
    Ok(view.into_iter().find(|item| item.name == name))
}

/// Like [`find_by_name`] but absence is a [`CloneError::NotFound`].
///
/// # Errors
/// Returns `NotFound` when nothing matches, or the control-plane failure.
pub async fn require_by_name<P: ControlPlane + ?Sized>(
    plane: &P,
    scope: Option<&ResourceRef>,
    kind: ResourceKind,
    name: &str,
) -> Result<ResourceRef, CloneError> {
    find_by_name(plane, scope, kind, name)
        .await?
        .ok_or_else(|| CloneError::not_found(kind, name))
}

/// First node below `root` (excluding `root`) whose name is `name` and, when
/// given, whose kind is `kind`.
///
/// Pre-order: a child is inspected, then its whole subtree is searched before
/// its next sibling is inspected.
#[must_use]
pub fn find_in_tree<'a>(
    root: &'a InventoryNode,
    kind: Option<ResourceKind>,
    name: &str,
) -> Option<&'a InventoryNode> {
    let mut stack: Vec<&InventoryNode> = root.children.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if node.name() == name && kind.map_or(true, |k| node.resource.kind == k) {
            return Some(node);
        }
        stack.extend(node.children.iter().rev());
    }

    None
}

/// First folder named `name` below `root`.
#[must_use]
pub fn find_folder<'a>(root: &'a InventoryNode, name: &str) -> Option<&'a InventoryNode> {
    find_in_tree(root, Some(ResourceKind::Folder), name)
}

/// Resolve a `/`-separated folder path. Each segment is searched with
/// [`find_folder`] inside the subtree matched by the previous one, so
/// intermediate folders may be skipped (`"prod/web"` matches
/// `prod/eu/web`). Empty segments are ignored; a path without segments
/// resolves to nothing.
#[must_use]
pub fn resolve_folder_path<'a>(root: &'a InventoryNode, path: &str) -> Option<&'a InventoryNode> {
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    segments.peek()?;

    let mut current = root;
    for segment in segments {
        current = find_folder(current, segment)?;
    }
    Some(current)
}
