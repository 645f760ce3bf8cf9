// The whole crate is the pdfium-backed page source; without the engine
// feature it compiles to nothing.
#![cfg(feature = "pdf")]

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use folio_core::{
    DocumentInfo, DocumentProvider, OutlineItem, PageSource, RenderedPage, ViewerError,
    ViewerResult,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{instrument, warn};

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    fn supported_extensions(&self) -> &[&str] {
        &["pdf"]
    }

    async fn open(&self, path: &Path) -> ViewerResult<Arc<dyn PageSource>> {
        let absolute = path.canonicalize().map_err(|err| {
            ViewerError::document_open(path, format!("could not resolve path: {err}"))
        })?;
        let info = inspect_document(&self.pdfium, &absolute)?;
        Ok(Arc::new(PdfiumPageSource::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

struct PdfiumPageSource {
    // Declared before `pdfium`: struct fields drop in declaration order, so
    // the handle is closed while the bindings it borrows are still alive.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    info: DocumentInfo,
}

impl PdfiumPageSource {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            pdfium,
            path,
            info,
        }
    }

    fn open_document(&self) -> ViewerResult<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .map_err(|err| open_failure(&self.path, &err))?;
        // SAFETY: the document borrows the Pdfium bindings kept alive by the
        // Arc in self.pdfium. The handle only ever lives in self.document,
        // which is declared before pdfium and therefore dropped first, so the
        // borrowed bindings outlive the handle.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> ViewerResult<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> ViewerResult<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            *guard = Some(self.open_document()?);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }

    fn with_page<R, F>(&self, page_index: usize, f: F) -> ViewerResult<R>
    where
        F: FnOnce(&PdfPage<'_>) -> ViewerResult<R>,
    {
        self.with_document(|document| {
            let index = PdfPageIndex::try_from(page_index).map_err(|_| {
                ViewerError::PageOutOfRange {
                    page: page_index,
                    page_count: self.info.page_count,
                }
            })?;
            let page = document
                .pages()
                .get(index)
                .map_err(|_| ViewerError::PageOutOfRange {
                    page: page_index,
                    page_count: self.info.page_count,
                })?;
            f(&page)
        })
    }
}

impl PageSource for PdfiumPageSource {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn native_size(&self, page_index: usize) -> ViewerResult<(f32, f32)> {
        self.with_page(page_index, |page| {
            Ok((page.width().value, page.height().value))
        })
    }

    #[instrument(skip(self))]
    fn rasterize(&self, page_index: usize, scale: f32) -> ViewerResult<RenderedPage> {
        self.with_page(page_index, |page| {
            let config = PdfRenderConfig::new().scale_page_by_factor(scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .map_err(|err| ViewerError::page_render(page_index, err))?;
            let image: image::RgbImage = bitmap.as_image().to_rgb8();
            let (width, height) = image.dimensions();
            Ok(RenderedPage {
                width,
                height,
                pixels: image.into_raw(),
            })
        })
    }
}

fn inspect_document(pdfium: &Pdfium, path: &Path) -> ViewerResult<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|err| open_failure(path, &err))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = collect_metadata(&document);
    let mut outline = Vec::new();
    if let Some(root) = document.bookmarks().root() {
        collect_outline(root, 0, &mut outline);
    }
    Ok(DocumentInfo {
        path: path.to_path_buf(),
        page_count,
        metadata,
        outline,
    })
}

const METADATA_TAGS: [(PdfDocumentMetadataTagType, &str); 8] = [
    (PdfDocumentMetadataTagType::Title, "title"),
    (PdfDocumentMetadataTagType::Author, "author"),
    (PdfDocumentMetadataTagType::Subject, "subject"),
    (PdfDocumentMetadataTagType::Keywords, "keywords"),
    (PdfDocumentMetadataTagType::Creator, "creator"),
    (PdfDocumentMetadataTagType::Producer, "producer"),
    (PdfDocumentMetadataTagType::CreationDate, "creation_date"),
    (PdfDocumentMetadataTagType::ModificationDate, "modification_date"),
];

fn collect_metadata(document: &PdfDocument<'_>) -> BTreeMap<String, String> {
    let metadata = document.metadata();
    let mut map = BTreeMap::new();
    for (tag, key) in METADATA_TAGS {
        if let Some(entry) = metadata.get(tag) {
            let value = entry.value().trim().to_owned();
            if !value.is_empty() {
                map.insert(key.to_owned(), value);
            }
        }
    }
    // Password-protected documents are rejected at open, so anything that got
    // this far renders without credentials.
    map.insert("encrypted".to_owned(), "false".to_owned());
    map
}

fn collect_outline(mut bookmark: PdfBookmark<'_>, depth: usize, out: &mut Vec<OutlineItem>) {
    loop {
        if let Some(title) = bookmark.title() {
            if let Some(destination) = bookmark.destination() {
                if let Ok(page_index) = destination.page_index() {
                    out.push(OutlineItem {
                        depth,
                        title,
                        page_index: page_index as usize,
                    });
                }
            }
        }

        if let Some(child) = bookmark.first_child() {
            collect_outline(child, depth + 1, out);
        }

        match bookmark.next_sibling() {
            Some(next) => bookmark = next,
            None => break,
        }
    }
}

fn open_failure(path: &Path, err: &PdfiumError) -> ViewerError {
    ViewerError::document_open(path, classify_open_failure(&err.to_string()))
}

fn classify_open_failure(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        "document is encrypted and passwords are not supported".to_string()
    } else {
        format!("engine rejected the document: {text}")
    }
}

fn bind_from_build_hint() -> Option<Pdfium> {
    match option_env!("FOLIO_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(
                    "failed to load pdfium from build-provided path {}: {}",
                    path, err
                );
                None
            }
        },
        _ => None,
    }
}

fn bind_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
