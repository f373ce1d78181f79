//! Graph rendering through an external layout tool.
//!
//! The layout itself is delegated to Graphviz: the description is piped to `dot` on stdin
//! and the image is read back from stdout.

use crate::error::{ClientError, Result};
use crate::model::{GraphDescription, JobId};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Rasterization DPI. Browsers map 1pt to 96/72 px, so PNGs at 96 DPI keep the SVG's
/// natural pixel size.
const RASTER_DPI: u32 = 96;

/// SVG document produced from a graph description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub source: GraphDescription,
    pub svg: String,
}

impl RenderedImage {
    pub fn job_id(&self) -> &JobId {
        &self.source.job_id
    }

    /// Natural pixel size read from the root element's `width`/`height`.
    pub fn pixel_size(&self) -> Option<(u32, u32)> {
        svg_pixel_size(&self.svg)
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Lay out and draw the description as SVG.
    async fn render_svg(&self, description: &GraphDescription) -> Result<RenderedImage>;

    /// Rasterize a rendered image to PNG at its natural pixel size.
    async fn rasterize_png(&self, image: &RenderedImage) -> Result<Vec<u8>>;
}

/// Renderer backed by the Graphviz `dot` executable.
#[derive(Debug, Clone)]
pub struct GraphvizRenderer {
    command: String,
}

impl GraphvizRenderer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, args: &[&str], input: &str) -> Result<Vec<u8>> {
        debug!(command = %self.command, ?args, "spawning renderer");
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Render(format!("cannot start `{}`: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Render("renderer stdin unavailable".into()))?;
        let input = input.as_bytes().to_vec();
        // Feed stdin concurrently so a large output cannot deadlock on a full pipe.
        let writer = tokio::spawn(async move {
            let res = stdin.write_all(&input).await;
            drop(stdin);
            res
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ClientError::Render(format!("renderer did not finish: {e}")))?;
        if let Ok(Err(e)) = writer.await {
            debug!("renderer closed stdin early: {e}");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::Render(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Renderer for GraphvizRenderer {
    async fn render_svg(&self, description: &GraphDescription) -> Result<RenderedImage> {
        check_description(&description.text)?;
        let out = self.run(&["-Tsvg"], &description.text).await?;
        let svg = String::from_utf8(out)
            .map_err(|_| ClientError::Render("renderer produced non UTF-8 SVG".into()))?;
        Ok(RenderedImage {
            source: description.clone(),
            svg,
        })
    }

    async fn rasterize_png(&self, image: &RenderedImage) -> Result<Vec<u8>> {
        let dpi = format!("-Gdpi={RASTER_DPI}");
        self.run(&["-Tpng", &dpi], &image.source.text).await
    }
}

type Scan<'a> = std::iter::Peekable<std::str::Chars<'a>>;

/// Cheap structural check run before spawning the renderer: a `graph`/`digraph` header
/// and balanced braces. Comments, `#` lines, quoted strings and HTML strings are opaque.
pub fn check_description(text: &str) -> Result<()> {
    let body = text.trim_start_matches('\u{feff}');
    if body.trim().is_empty() {
        return Err(ClientError::Render("graph description is empty".into()));
    }

    // Identifiers before the first punctuation: `[strict] (graph|digraph) [name]`.
    let mut header: Vec<String> = Vec::new();
    let mut header_open = true;
    let mut word = String::new();
    let mut depth = 0i64;
    let mut line_start = true;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            line_start = false;
            continue;
        }
        if header_open && !word.is_empty() {
            header.push(std::mem::take(&mut word));
        }
        word.clear();

        match c {
            '\n' => line_start = true,
            c if c.is_whitespace() => {}
            '#' if line_start => {
                skip_line(&mut chars);
            }
            '/' if chars.peek() == Some(&'/') => {
                skip_line(&mut chars);
                line_start = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                skip_block_comment(&mut chars)?;
            }
            _ => {
                line_start = false;
                header_open = false;
                match c {
                    '"' => skip_quoted(&mut chars)?,
                    '<' => skip_html(&mut chars)?,
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth < 0 {
                            return Err(ClientError::Render("unbalanced `}`".into()));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    if header_open && !word.is_empty() {
        header.push(word);
    }

    let mut head = header.iter().map(|w| w.to_ascii_lowercase());
    let first = head.next().unwrap_or_default();
    let keyword = if first == "strict" {
        head.next().unwrap_or_default()
    } else {
        first
    };
    if keyword != "graph" && keyword != "digraph" {
        return Err(ClientError::Render(
            "graph description must start with `graph` or `digraph`".into(),
        ));
    }
    if depth != 0 {
        return Err(ClientError::Render("unbalanced braces".into()));
    }
    Ok(())
}

/// Consume through the end of the current line.
fn skip_line(chars: &mut Scan<'_>) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
}

fn skip_block_comment(chars: &mut Scan<'_>) -> Result<()> {
    let mut star = false;
    for c in chars.by_ref() {
        if star && c == '/' {
            return Ok(());
        }
        star = c == '*';
    }
    Err(ClientError::Render("unterminated comment".into()))
}

fn skip_quoted(chars: &mut Scan<'_>) -> Result<()> {
    let mut escaped = false;
    for c in chars.by_ref() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Ok(()),
            _ => escaped = false,
        }
    }
    Err(ClientError::Render("unterminated string".into()))
}

/// HTML strings are delimited by balanced `<` `>`; the opening `<` is already consumed.
fn skip_html(chars: &mut Scan<'_>) -> Result<()> {
    let mut depth = 1u32;
    for c in chars.by_ref() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            _ => {}
        }
    }
    Err(ClientError::Render("unterminated HTML string".into()))
}

/// Parse `width`/`height` from the `<svg>` element and convert to pixels.
pub fn svg_pixel_size(svg: &str) -> Option<(u32, u32)> {
    let start = svg.find("<svg")?;
    let tag_end = svg[start..].find('>')? + start;
    let tag = &svg[start..tag_end];
    let width = attr_value(tag, "width").and_then(length_to_px)?;
    let height = attr_value(tag, "height").and_then(length_to_px)?;
    Some((width, height))
}

fn attr_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!(" {name}=\"");
    let pos = tag.find(&needle)? + needle.len();
    let end = tag[pos..].find('"')? + pos;
    Some(&tag[pos..end])
}

fn length_to_px(value: &str) -> Option<u32> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (num, unit) = value.split_at(split);
    let n: f64 = num.parse().ok()?;
    let px = match unit.trim() {
        "" | "px" => n,
        "pt" => n * 96.0 / 72.0,
        "in" => n * 96.0,
        _ => return None,
    };
    Some(px.round() as u32)
}
