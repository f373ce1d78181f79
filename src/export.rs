//! Image export.
//!
//! SVG is written verbatim from the session; PNG is produced by the renderer.

use crate::error::{ClientError, Result};
use crate::orchestrator::Session;
use crate::render::{RenderedImage, Renderer};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Svg,
    Png,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Svg => "svg",
            ExportFormat::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::Svg => "image/svg+xml",
            ExportFormat::Png => "image/png",
        }
    }
}

/// `archgraph-<job prefix>.<ext>` in `dir`.
pub fn default_export_path(dir: &Path, image: &RenderedImage, format: ExportFormat) -> PathBuf {
    dir.join(format!(
        "archgraph-{}.{}",
        image.job_id().file_stem(),
        format.extension()
    ))
}

/// Export the session's current image to `path`, or to the default name in the current
/// directory. Returns `None` without touching the filesystem when nothing has been rendered.
pub async fn export_image(
    session: &Session,
    renderer: &dyn Renderer,
    format: ExportFormat,
    path: Option<&Path>,
) -> Result<Option<PathBuf>> {
    let Some(image) = session.current_image() else {
        return Ok(None);
    };

    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let cwd = std::env::current_dir()?;
            default_export_path(&cwd, image, format)
        }
    };

    let bytes = match format {
        ExportFormat::Svg => image.svg.as_bytes().to_vec(),
        ExportFormat::Png => renderer.rasterize_png(image).await?,
    };
    if bytes.is_empty() {
        return Err(ClientError::Export(format!(
            "renderer produced an empty {} image",
            format.extension()
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ClientError::Export(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), mime = format.mime_type(), bytes = bytes.len(), "exported image");
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeRenderer;
    use crate::model::{GraphDescription, JobId};

    fn rendered() -> RenderedImage {
        RenderedImage {
            source: GraphDescription {
                job_id: JobId::from("0f8fad5b-d9cb-469f"),
                text: "digraph { a -> b }".into(),
            },
            svg: "<svg width=\"10pt\" height=\"10pt\">\u{e9}</svg>\n".into(),
        }
    }

    #[tokio::test]
    async fn export_without_render_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.svg");
        let session = Session::new();

        let res = export_image(&session, &FakeRenderer::default(), ExportFormat::Svg, Some(&target))
            .await
            .unwrap();

        assert!(res.is_none());
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn svg_export_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/graph.svg");
        let mut session = Session::new();
        session.set_image(rendered());

        let written = export_image(&session, &FakeRenderer::default(), ExportFormat::Svg, Some(&target))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(written, target);
        assert_eq!(std::fs::read(&target).unwrap(), rendered().svg.into_bytes());
    }

    #[tokio::test]
    async fn png_export_goes_through_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("graph.png");
        let mut session = Session::new();
        session.set_image(rendered());

        export_image(&session, &FakeRenderer::default(), ExportFormat::Png, Some(&target))
            .await
            .unwrap();

        let bytes = std::fs::read(&target).unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));
    }

    #[test]
    fn default_name_uses_job_prefix() {
        let p = default_export_path(Path::new("/tmp"), &rendered(), ExportFormat::Png);
        assert_eq!(p, Path::new("/tmp/archgraph-0f8fad5b.png"));
        assert_eq!(ExportFormat::Svg.mime_type(), "image/svg+xml");
    }
}
