use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::graph::Graph;
use crate::id::ImageId;
use crate::record::{list_records, record_exists, write_atomic};

/// point tag `name` at an image (create or move)
///
/// names may contain slashes, like `library/alpine:3.19`.
pub fn tag_image(graph: &Graph, name: &str, image: &ImageId) -> Result<()> {
    validate_tag_name(name)?;
    if !record_exists(&graph.images_path(), &image.digest().to_hex()) {
        return Err(Error::not_found("image", image));
    }
    write_atomic(graph, &tag_path(graph, name), format!("{}\n", image).as_bytes())
}

/// image a tag points at
pub fn resolve_tag(graph: &Graph, name: &str) -> Result<ImageId> {
    validate_tag_name(name)?;
    let path = tag_path(graph, name);
    let content = fs::read_to_string(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::not_found("tag", name)
        } else {
            Error::Io {
                path: path.clone(),
                source: e,
            }
        }
    })?;
    ImageId::parse(content.trim())
}

/// delete a tag
pub fn untag(graph: &Graph, name: &str) -> Result<()> {
    validate_tag_name(name)?;
    let path = tag_path(graph, name);
    fs::remove_file(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::not_found("tag", name)
        } else {
            Error::Io { path, source: e }
        }
    })
}

pub fn tag_exists(graph: &Graph, name: &str) -> bool {
    validate_tag_name(name).is_ok() && tag_path(graph, name).is_file()
}

/// list all tags
pub fn list_tags(graph: &Graph) -> Result<Vec<String>> {
    let tags_dir = graph.tags_path();
    let mut tags = Vec::new();

    if tags_dir.exists() {
        collect_tags(&tags_dir, &tags_dir, &mut tags)?;
    }

    tags.sort();
    Ok(tags)
}

/// list tags matching a glob pattern
pub fn list_tags_matching(graph: &Graph, pattern: &str) -> Result<Vec<String>> {
    let all_tags = list_tags(graph)?;
    let glob = glob::Pattern::new(pattern).map_err(|e| Error::InvalidTag(e.to_string()))?;

    Ok(all_tags.into_iter().filter(|t| glob.matches(t)).collect())
}

/// every tag pointing at `image`
pub fn tags_for_image(graph: &Graph, image: &ImageId) -> Result<Vec<String>> {
    let mut tags = Vec::new();
    for tag in list_tags(graph)? {
        if resolve_tag(graph, &tag)? == *image {
            tags.push(tag);
        }
    }
    Ok(tags)
}

/// resolve a tag, a full image id or a unique id prefix to an image id
///
/// full ids win over tags, tags over prefixes.
pub fn resolve_image(graph: &Graph, name: &str) -> Result<ImageId> {
    let images = list_records(&graph.images_path())?;

    if let Ok(id) = ImageId::parse(name) {
        if images.contains(&id.digest().to_hex()) {
            return Ok(id);
        }
    }

    if tag_exists(graph, name) {
        return resolve_tag(graph, name);
    }

    let prefix = name.strip_prefix("sha256:").unwrap_or(name);
    if prefix.len() >= 4 && prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
        let prefix = prefix.to_ascii_lowercase();
        let mut matches = images.iter().filter(|hex| hex.starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(hex), None) => return ImageId::parse(hex),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidId(format!("ambiguous image id prefix {}", name)))
            }
            _ => {}
        }
    }

    Err(Error::not_found("image", name))
}

/// get filesystem path for a tag
fn tag_path(graph: &Graph, name: &str) -> PathBuf {
    graph.tags_path().join(name)
}

/// recursively collect tags from directory
fn collect_tags(base: &Path, dir: &Path, tags: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        let path = entry.path();

        if path.is_dir() {
            collect_tags(base, &path, tags)?;
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                tags.push(rel.to_string_lossy().to_string());
            }
        }
    }
    Ok(())
}

pub(crate) fn validate_tag_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidTag("empty tag name".to_string()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidTag(format!(
            "tag name cannot start or end with '/': {}",
            name
        )));
    }

    if name.contains("//") {
        return Err(Error::InvalidTag(format!("tag name cannot contain '//': {}", name)));
    }

    if name.contains('\0') {
        return Err(Error::InvalidTag(format!(
            "tag name cannot contain null byte: {}",
            name
        )));
    }

    // check for path traversal
    for component in name.split('/') {
        if component == "." || component == ".." {
            return Err(Error::InvalidTag(format!(
                "tag name cannot contain '.' or '..': {}",
                name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::test_graph;
    use crate::hash::digest_bytes;
    use crate::record::write_record;

    /// a bare image record, enough for tags to resolve against
    fn fake_image(graph: &Graph, seed: &[u8]) -> ImageId {
        let id = ImageId::from_digest(digest_bytes(seed));
        write_record(graph, &graph.images_path(), &id.digest().to_hex(), &seed.to_vec()).unwrap();
        id
    }

    #[test]
    fn test_tag_and_resolve() {
        let (_dir, graph) = test_graph();
        let id = fake_image(&graph, b"one");

        tag_image(&graph, "library/alpine:3.19", &id).unwrap();
        assert_eq!(resolve_tag(&graph, "library/alpine:3.19").unwrap(), id);
        assert_eq!(list_tags(&graph).unwrap(), vec!["library/alpine:3.19"]);
    }

    #[test]
    fn test_tag_requires_existing_image() {
        let (_dir, graph) = test_graph();
        let id = ImageId::from_digest(digest_bytes(b"missing"));
        let err = tag_image(&graph, "x", &id).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "image", .. }));
    }

    #[test]
    fn test_retag_moves() {
        let (_dir, graph) = test_graph();
        let a = fake_image(&graph, b"a");
        let b = fake_image(&graph, b"b");

        tag_image(&graph, "app:latest", &a).unwrap();
        tag_image(&graph, "app:latest", &b).unwrap();
        assert_eq!(resolve_tag(&graph, "app:latest").unwrap(), b);
        assert!(tags_for_image(&graph, &a).unwrap().is_empty());
    }

    #[test]
    fn test_untag() {
        let (_dir, graph) = test_graph();
        let id = fake_image(&graph, b"one");
        tag_image(&graph, "t", &id).unwrap();

        untag(&graph, "t").unwrap();
        assert!(!tag_exists(&graph, "t"));
        assert!(matches!(untag(&graph, "t"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_list_tags_matching() {
        let (_dir, graph) = test_graph();
        let id = fake_image(&graph, b"one");
        tag_image(&graph, "alpine:3.19", &id).unwrap();
        tag_image(&graph, "alpine:edge", &id).unwrap();
        tag_image(&graph, "debian:12", &id).unwrap();

        assert_eq!(list_tags_matching(&graph, "alpine:*").unwrap().len(), 2);
        assert_eq!(tags_for_image(&graph, &id).unwrap().len(), 3);
    }

    #[test]
    fn test_resolve_image_by_id_tag_and_prefix() {
        let (_dir, graph) = test_graph();
        let id = fake_image(&graph, b"one");
        tag_image(&graph, "app", &id).unwrap();

        assert_eq!(resolve_image(&graph, &id.to_string()).unwrap(), id);
        assert_eq!(resolve_image(&graph, &id.digest().to_hex()).unwrap(), id);
        assert_eq!(resolve_image(&graph, "app").unwrap(), id);
        assert_eq!(resolve_image(&graph, &id.short()).unwrap(), id);
        assert!(matches!(
            resolve_image(&graph, "nothing"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_tag_names() {
        assert!(validate_tag_name("").is_err());
        assert!(validate_tag_name("/start").is_err());
        assert!(validate_tag_name("end/").is_err());
        assert!(validate_tag_name("double//slash").is_err());
        assert!(validate_tag_name("with/../dotdot").is_err());
        assert!(validate_tag_name("with\0null").is_err());

        assert!(validate_tag_name("alpine:3.19").is_ok());
        assert!(validate_tag_name("registry/library/alpine:latest").is_ok());
    }
}
