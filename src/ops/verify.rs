use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::hash::Digest;
use crate::ops::container::list_containers;
use crate::ops::filesystem::filesystem;
use crate::ops::image::list_images;
use crate::ops::layer::list_layers;
use crate::record::{blob_exists, hash_blob};

/// verify report
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub layers_checked: usize,
    pub images_checked: usize,
    /// blobs re-hashed
    pub blobs_checked: usize,
    pub problems: Vec<Problem>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, kind: ProblemKind, subject: &str, message: String) {
        self.problems.push(Problem {
            kind,
            subject: subject.to_string(),
            message,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub kind: ProblemKind,
    /// the record the problem was found on, e.g. `layer sha256:...`
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    /// stored bytes do not hash to their name
    Corrupt,
    /// a record refers to something that is not there
    Missing,
    /// records disagree with each other
    Inconsistent,
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProblemKind::Corrupt => write!(f, "corrupt"),
            ProblemKind::Missing => write!(f, "missing"),
            ProblemKind::Inconsistent => write!(f, "inconsistent"),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.subject, self.message)
    }
}

/// check every record and blob in the store
///
/// layer blobs must hash to their diff id and config blobs to their
/// digest; parents, filesystems, images and containers must all resolve.
/// nothing is repaired.
pub fn verify(graph: &Graph) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let mut hashed = HashSet::new();

    let layers = list_layers(graph)?;
    let layer_ids: HashSet<_> = layers.iter().map(|l| l.id).collect();

    for layer in &layers {
        report.layers_checked += 1;
        let subject = format!("layer {}", layer.id);

        check_blob(graph, layer.diff_id.digest(), &subject, &mut hashed, &mut report)?;

        if let Some(parent) = &layer.parent {
            if !layer_ids.contains(parent) {
                report.problem(ProblemKind::Missing, &subject, format!("parent layer {}", parent));
            }
        }

        match filesystem(graph, &layer.filesystem) {
            Ok(fs) => {
                if !fs.is_committed() || fs.layer.as_ref() != Some(&layer.id) {
                    report.problem(
                        ProblemKind::Inconsistent,
                        &subject,
                        format!("filesystem {} does not record this layer", fs.id),
                    );
                }
                if !graph.backend().exists(&fs.id)? {
                    report.problem(
                        ProblemKind::Missing,
                        &subject,
                        format!("backing store of filesystem {}", fs.id),
                    );
                }
            }
            Err(Error::NotFound { .. }) => report.problem(
                ProblemKind::Missing,
                &subject,
                format!("filesystem {}", layer.filesystem),
            ),
            Err(e) => return Err(e),
        }
    }

    let images = list_images(graph)?;
    let image_ids: HashSet<_> = images.iter().map(|i| i.id).collect();
    for image in &images {
        report.images_checked += 1;
        let subject = format!("image {}", image.id);
        for id in &image.layers {
            if !layer_ids.contains(id) {
                report.problem(ProblemKind::Missing, &subject, format!("layer {}", id));
            }
        }
        check_blob(graph, &image.config, &subject, &mut hashed, &mut report)?;
    }

    for container in list_containers(graph)? {
        let subject = format!("container {}", container.id);
        if !image_ids.contains(&container.image) {
            report.problem(ProblemKind::Missing, &subject, format!("image {}", container.image));
        }
        match filesystem(graph, &container.filesystem) {
            Ok(fs) if fs.container.as_ref() != Some(&container.id) => report.problem(
                ProblemKind::Inconsistent,
                &subject,
                format!("filesystem {} is not owned by this container", fs.id),
            ),
            Ok(_) => {}
            Err(Error::NotFound { .. }) => report.problem(
                ProblemKind::Missing,
                &subject,
                format!("filesystem {}", container.filesystem),
            ),
            Err(e) => return Err(e),
        }
    }

    debug!(
        layers = report.layers_checked,
        blobs = report.blobs_checked,
        problems = report.problems.len(),
        "verified store"
    );
    Ok(report)
}

/// re-hash a blob once, however many records share it
fn check_blob(
    graph: &Graph,
    digest: &Digest,
    subject: &str,
    hashed: &mut HashSet<Digest>,
    report: &mut VerifyReport,
) -> Result<()> {
    if !blob_exists(graph, digest) {
        report.problem(ProblemKind::Missing, subject, format!("blob {}", digest));
        return Ok(());
    }
    if !hashed.insert(*digest) {
        return Ok(());
    }
    report.blobs_checked += 1;
    let (actual, _) = hash_blob(graph, digest)?;
    if actual != *digest {
        report.problem(
            ProblemKind::Corrupt,
            subject,
            format!("blob {} hashes to {}", digest, actual),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::test_graph;
    use crate::ops::container::create_container;
    use crate::ops::image::ImageBuilder;
    use crate::ops::layer::layer_blob_path;
    use crate::record::{blob_path, delete_record};
    use crate::error::IoResultExt;
    use crate::types::Image;
    use std::fs;

    fn two_layer_image(graph: &Graph) -> Image {
        let mut builder = ImageBuilder::new(graph);
        builder
            .step(|root| fs::write(root.join("a"), "0123456789").with_path(root))
            .unwrap();
        builder
            .step(|root| fs::write(root.join("b"), "hello").with_path(root))
            .unwrap();
        builder.finish(b"{}").unwrap()
    }

    #[test]
    fn test_verify_clean_store() {
        let (_dir, graph) = test_graph();
        let image = two_layer_image(&graph);
        create_container(&graph, &image.id).unwrap();

        let report = verify(&graph).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.layers_checked, 2);
        assert_eq!(report.images_checked, 1);
        assert_eq!(report.blobs_checked, 3);
    }

    #[test]
    fn test_verify_detects_corrupt_blob() {
        let (_dir, graph) = test_graph();
        let image = two_layer_image(&graph);
        let top = crate::ops::layer::layer(&graph, &image.layers[1]).unwrap();
        fs::write(layer_blob_path(&graph, &top), b"garbage").unwrap();

        let report = verify(&graph).unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.problems.len(), 1);
        assert_eq!(report.problems[0].kind, ProblemKind::Corrupt);
    }

    #[test]
    fn test_verify_detects_missing_records() {
        let (_dir, graph) = test_graph();
        let image = two_layer_image(&graph);
        fs::remove_file(blob_path(&graph, &image.config)).unwrap();
        delete_record(&graph.layers_path(), &image.layers[0].digest().to_hex()).unwrap();

        let report = verify(&graph).unwrap();
        let missing = report
            .problems
            .iter()
            .filter(|p| p.kind == ProblemKind::Missing)
            .count();
        // config blob, parent of the top layer, first layer of the image
        assert_eq!(missing, 3);
    }
}
