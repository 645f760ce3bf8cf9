use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub type ViewerResult<T> = Result<T, ViewerError>;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("unsupported file type: .{extension}")]
    UnsupportedFormat { extension: String },

    #[error("could not open {}: {reason}", path.display())]
    DocumentOpen { path: PathBuf, reason: String },

    #[error("no document is loaded")]
    NoDocument,

    #[error("page {page} out of range: document has {page_count} pages")]
    PageOutOfRange { page: usize, page_count: usize },

    #[error("failed to render page {page}")]
    PageRender {
        page: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("settings I/O failed at {}", path.display())]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ViewerError {
    pub fn document_open(path: &Path, reason: impl Into<String>) -> Self {
        Self::DocumentOpen {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn page_render(
        page: usize,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::PageRender {
            page,
            source: source.into(),
        }
    }

    pub fn settings_io(
        path: &Path,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SettingsIo {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn is_dark(self) -> bool {
        matches!(self, Theme::Dark)
    }
}

pub const MIN_BRIGHTNESS: f32 = 0.1;
pub const MAX_BRIGHTNESS: f32 = 2.0;

// Fixed dim applied after inversion in dark mode.
const DARK_DIM: f32 = 0.7;

const BRIGHTNESS_TOLERANCE: f32 = 1e-3;

pub fn clamp_brightness(value: f32) -> f32 {
    if !value.is_finite() {
        return 1.0;
    }
    value.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)
}

/// Brightness and theme applied to rasterized pages before display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Appearance {
    pub brightness: f32,
    pub theme: Theme,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            theme: Theme::Light,
        }
    }
}

impl Appearance {
    pub fn new(brightness: f32, theme: Theme) -> Self {
        Self {
            brightness: clamp_brightness(brightness),
            theme,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.theme == Theme::Light && (self.brightness - 1.0).abs() <= BRIGHTNESS_TOLERANCE
    }

    /// Transforms the buffer in place. Identity appearance leaves every byte
    /// untouched; dimensions never change.
    pub fn apply_to(&self, page: &mut RenderedPage) {
        if self.is_identity() {
            return;
        }
        let lut = self.lookup_table();
        for byte in page.pixels.iter_mut() {
            *byte = lut[*byte as usize];
        }
    }

    // Order: brightness multiply, then inversion, then the fixed dim. Both
    // stages round and clamp into byte range before the next one reads them.
    fn lookup_table(&self) -> [u8; 256] {
        let mut lut = [0u8; 256];
        for (value, slot) in lut.iter_mut().enumerate() {
            let mut level = (value as f32 * self.brightness).round().clamp(0.0, 255.0);
            if self.theme.is_dark() {
                level = ((255.0 - level) * DARK_DIM).round().clamp(0.0, 255.0);
            }
            *slot = level as u8;
        }
        lut
    }
}

/// One rasterized page: RGB8, row-major, three bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderedPage {
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlineItem {
    pub depth: usize,
    pub title: String,
    pub page_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: BTreeMap<String, String>,
    pub outline: Vec<OutlineItem>,
}

pub trait PageSource: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    /// Page size in engine points at scale 1.0.
    fn native_size(&self, page_index: usize) -> ViewerResult<(f32, f32)>;
    /// Rasterizes one page with the scale applied uniformly to both axes.
    fn rasterize(&self, page_index: usize, scale: f32) -> ViewerResult<RenderedPage>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    fn supported_extensions(&self) -> &[&str];
    async fn open(&self, path: &Path) -> ViewerResult<Arc<dyn PageSource>>;
}

pub const MIN_ZOOM: f32 = 0.1;
pub const MAX_ZOOM: f32 = 5.0;
pub const ZOOM_IN_STEP: f32 = 1.25;
pub const ZOOM_OUT_STEP: f32 = 0.8;

const DEFAULT_ZOOM: f32 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct ZoomBounds {
    pub min: f32,
    pub max: f32,
}

impl Default for ZoomBounds {
    fn default() -> Self {
        Self {
            min: MIN_ZOOM,
            max: MAX_ZOOM,
        }
    }
}

impl ZoomBounds {
    fn clamp(&self, zoom: f32) -> f32 {
        if !zoom.is_finite() {
            return DEFAULT_ZOOM.clamp(self.min, self.max);
        }
        zoom.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RenderKey {
    page_index: usize,
    zoom_milli: u32,
    brightness_milli: u32,
    theme: Theme,
}

impl RenderKey {
    fn new(page_index: usize, zoom: f32, appearance: Appearance) -> Self {
        Self {
            page_index,
            zoom_milli: quantize(zoom),
            brightness_milli: quantize(appearance.brightness),
            theme: appearance.theme,
        }
    }
}

fn quantize(value: f32) -> u32 {
    let scaled = (value * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

struct RenderSlot {
    key: RenderKey,
    image: RenderedPage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewStatus {
    /// 1-based "current/total"; "0/0" while no document is loaded.
    pub page_label: String,
    pub zoom_percent: u32,
    /// Size of the most recent render, if any page was rendered yet.
    pub pixel_size: Option<(u32, u32)>,
    pub message: String,
}

pub struct DocumentSession {
    source: Option<Arc<dyn PageSource>>,
    current_page: usize,
    zoom: f32,
    appearance: Appearance,
    bounds: ZoomBounds,
    render_slot: Mutex<Option<RenderSlot>>,
    status_message: String,
}

impl Default for DocumentSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentSession {
    pub fn new() -> Self {
        Self::with_zoom_bounds(MIN_ZOOM, MAX_ZOOM)
    }

    pub fn with_zoom_bounds(min: f32, max: f32) -> Self {
        Self {
            source: None,
            current_page: 0,
            zoom: DEFAULT_ZOOM,
            appearance: Appearance::default(),
            bounds: ZoomBounds { min, max },
            render_slot: Mutex::new(None),
            status_message: "Ready".to_string(),
        }
    }

    pub fn apply_settings(&mut self, settings: &ViewSettings) {
        self.appearance = Appearance::new(settings.brightness, settings.theme);
    }

    pub fn is_loaded(&self) -> bool {
        self.source.is_some()
    }

    pub fn info(&self) -> Option<&DocumentInfo> {
        self.source.as_ref().map(|source| source.info())
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn appearance(&self) -> Appearance {
        self.appearance
    }

    /// Opens `path`, replacing any current document. The current document is
    /// closed before the open is attempted; a failed open leaves the session
    /// empty rather than restoring the old document.
    #[instrument(skip(self, provider))]
    pub async fn load<P: DocumentProvider>(
        &mut self,
        provider: &P,
        path: &Path,
    ) -> ViewerResult<DocumentInfo> {
        self.close();

        if !path.exists() {
            return Err(ViewerError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !provider
            .supported_extensions()
            .iter()
            .any(|supported| *supported == extension)
        {
            return Err(ViewerError::UnsupportedFormat { extension });
        }

        let source = provider.open(path).await?;
        let info = source.info().clone();
        if info.page_count == 0 {
            return Err(ViewerError::document_open(path, "document has no pages"));
        }

        self.source = Some(source);
        self.current_page = 0;
        self.zoom = DEFAULT_ZOOM;
        self.status_message = format!("Opened: {}", display_name(path));
        Ok(info)
    }

    /// Releases the current document. Safe to call while empty.
    pub fn close(&mut self) {
        if let Some(source) = self.source.take() {
            debug!(path = ?source.info().path, "closing document");
        }
        self.current_page = 0;
        self.zoom = DEFAULT_ZOOM;
        self.render_slot.lock().take();
        self.status_message = "Ready".to_string();
    }

    /// Rasterizes the current page at the current zoom and applies the
    /// appearance. Repeated calls with unchanged state return pixel-identical
    /// buffers; the most recent result is memoized.
    pub fn render_current_page(&self) -> ViewerResult<RenderedPage> {
        let source = self.require_source()?;
        let key = RenderKey::new(self.current_page, self.zoom, self.appearance);
        if let Some(slot) = self.render_slot.lock().as_ref() {
            if slot.key == key {
                debug!(page = self.current_page, "render served from cache");
                return Ok(slot.image.clone());
            }
        }

        let mut image = source.rasterize(self.current_page, self.zoom)?;
        self.appearance.apply_to(&mut image);
        *self.render_slot.lock() = Some(RenderSlot {
            key,
            image: image.clone(),
        });
        Ok(image)
    }

    /// Jumps to `page` (0-based). Out-of-range targets are rejected and leave
    /// the session unchanged; jumping to the current page succeeds as a no-op.
    pub fn go_to_page(&mut self, page: usize) -> ViewerResult<()> {
        let page_count = self.require_source()?.info().page_count;
        if page >= page_count {
            return Err(ViewerError::PageOutOfRange { page, page_count });
        }
        self.current_page = page;
        Ok(())
    }

    /// Advances one page; returns false at the last page without error.
    pub fn next_page(&mut self) -> ViewerResult<bool> {
        let page_count = self.require_source()?.info().page_count;
        if self.current_page + 1 < page_count {
            self.current_page += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Goes back one page; returns false at the first page without error.
    pub fn prev_page(&mut self) -> ViewerResult<bool> {
        self.require_source()?;
        if self.current_page > 0 {
            self.current_page -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Sets the zoom, multiplying the current value when `relative`. The
    /// result is always clamped into the session's bounds and returned.
    pub fn set_zoom(&mut self, factor: f32, relative: bool) -> ViewerResult<f32> {
        self.require_source()?;
        let target = if relative { self.zoom * factor } else { factor };
        self.zoom = self.bounds.clamp(target);
        Ok(self.zoom)
    }

    pub fn zoom_in(&mut self) -> ViewerResult<f32> {
        self.set_zoom(ZOOM_IN_STEP, true)
    }

    pub fn zoom_out(&mut self) -> ViewerResult<f32> {
        self.set_zoom(ZOOM_OUT_STEP, true)
    }

    /// Zoom such that the native page width fills `viewport_width` pixels.
    pub fn fit_width(&mut self, viewport_width: u32) -> ViewerResult<f32> {
        let (native_width, _) = self.native_page_size()?;
        self.zoom = self.bounds.clamp(viewport_width as f32 / native_width);
        Ok(self.zoom)
    }

    /// Zoom such that the whole page fits inside the viewport; the smaller of
    /// the two axis ratios wins. Computed from the native page size, never
    /// from a previously rendered bitmap.
    pub fn fit_page(&mut self, viewport_width: u32, viewport_height: u32) -> ViewerResult<f32> {
        let (native_width, native_height) = self.native_page_size()?;
        let fit = (viewport_width as f32 / native_width)
            .min(viewport_height as f32 / native_height);
        self.zoom = self.bounds.clamp(fit);
        Ok(self.zoom)
    }

    /// Clamps and applies the brightness; usable with no document loaded.
    pub fn set_brightness(&mut self, value: f32) -> f32 {
        self.appearance.brightness = clamp_brightness(value);
        self.appearance.brightness
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.appearance.theme = theme;
    }

    pub fn toggle_theme(&mut self) -> Theme {
        self.appearance.theme = self.appearance.theme.toggled();
        self.appearance.theme
    }

    pub fn status(&self) -> ViewStatus {
        let (current, total) = match self.source.as_ref() {
            Some(source) => (self.current_page + 1, source.info().page_count),
            None => (0, 0),
        };
        let pixel_size = self
            .render_slot
            .lock()
            .as_ref()
            .map(|slot| slot.image.pixel_size());
        ViewStatus {
            page_label: format!("{current}/{total}"),
            zoom_percent: (self.zoom * 100.0).round() as u32,
            pixel_size,
            message: self.status_message.clone(),
        }
    }

    fn require_source(&self) -> ViewerResult<&Arc<dyn PageSource>> {
        self.source.as_ref().ok_or(ViewerError::NoDocument)
    }

    fn native_page_size(&self) -> ViewerResult<(f32, f32)> {
        let source = self.require_source()?;
        source.native_size(self.current_page)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub const MAX_RECENT_FILES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    pub theme: Theme,
    pub brightness: f32,
    pub recent_files: Vec<PathBuf>,
    pub recent_files_limit: usize,
    pub window_size: (u32, u32),
    pub window_position: (i32, i32),
    pub window_maximized: bool,
    pub default_directory: Option<PathBuf>,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            brightness: 1.0,
            recent_files: Vec::new(),
            recent_files_limit: MAX_RECENT_FILES,
            window_size: (1024, 768),
            window_position: (100, 100),
            window_maximized: false,
            default_directory: None,
        }
    }
}

impl ViewSettings {
    /// Moves `path` to the front of the recent list, deduplicating and
    /// truncating to the configured limit.
    pub fn add_recent_file(&mut self, path: &Path) {
        let path = path.to_path_buf();
        self.recent_files.retain(|existing| existing != &path);
        self.recent_files.insert(0, path);
        self.recent_files.truncate(self.recent_files_limit);
    }

    pub fn clear_recent_files(&mut self) {
        self.recent_files.clear();
    }

    fn sanitized(mut self) -> Self {
        self.brightness = clamp_brightness(self.brightness);
        self.recent_files.truncate(self.recent_files_limit);
        self
    }
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> ViewerResult<Option<ViewSettings>>;
    fn save(&self, settings: &ViewSettings) -> ViewerResult<()>;

    /// Loads the settings, substituting defaults when the store is empty or
    /// unreadable. Read failures are logged and never propagate; the broken
    /// file is left in place until the next explicit save.
    fn load_or_default(&self) -> ViewSettings {
        match self.load() {
            Ok(Some(settings)) => settings,
            Ok(None) => ViewSettings::default(),
            Err(err) => {
                warn!(%err, "settings unreadable, falling back to defaults");
                ViewSettings::default()
            }
        }
    }
}

pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at_default_location() -> Option<Self> {
        directories::ProjectDirs::from("org", "folio", "folio")
            .map(|dirs| Self::new(dirs.config_dir().join("settings.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> ViewerResult<Option<ViewSettings>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&self.path).map_err(|err| ViewerError::settings_io(&self.path, err))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|err| ViewerError::settings_io(&self.path, err))?;
        let settings: ViewSettings =
            serde_json::from_str(&buf).map_err(|err| ViewerError::settings_io(&self.path, err))?;
        Ok(Some(settings.sanitized()))
    }

    fn save(&self, settings: &ViewSettings) -> ViewerResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| ViewerError::settings_io(&self.path, err))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(settings)
            .map_err(|err| ViewerError::settings_io(&self.path, err))?;
        let mut file =
            File::create(&tmp).map_err(|err| ViewerError::settings_io(&self.path, err))?;
        file.write_all(payload.as_bytes())
            .map_err(|err| ViewerError::settings_io(&self.path, err))?;
        file.flush()
            .map_err(|err| ViewerError::settings_io(&self.path, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| ViewerError::settings_io(&self.path, err))?;
        Ok(())
    }
}

pub struct MemorySettingsStore {
    inner: Mutex<Option<ViewSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> ViewerResult<Option<ViewSettings>> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, settings: &ViewSettings) -> ViewerResult<()> {
        *self.inner.lock() = Some(settings.clone());
        Ok(())
    }
}
