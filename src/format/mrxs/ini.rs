//! Slidedat.ini parsing.
//!
//! The INI file is the table of contents of an MRXS slide directory. It
//! declares the base tile grid, a list of *hierarchical* layers (the one
//! named "Slide zoom level" defines the pyramid), a list of *non-
//! hierarchical* layers (scan maps, thumbnails, barcode, stitching data),
//! the index file name, and the data file names.
//!
//! Scanner output is messy: files may start with a UTF-8 BOM or stray
//! high bytes, use CRLF, and pad keys and values with whitespace. The
//! parser tolerates all of that.

use std::collections::HashMap;

use crate::error::MrxsError;

/// Tile image format of one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MrxsImageFormat {
    #[default]
    Unknown,
    Jpeg,
    Png,
    Bmp,
}

impl MrxsImageFormat {
    fn parse(value: &str) -> Self {
        match value {
            "JPEG" => MrxsImageFormat::Jpeg,
            "PNG" => MrxsImageFormat::Png,
            "BMP24" => MrxsImageFormat::Bmp,
            _ => MrxsImageFormat::Unknown,
        }
    }
}

/// Recognized hierarchical layer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HierName {
    #[default]
    Other,
    SlideZoomLevel,
    SlideFilterLevel,
    MicroscopeFocusLevel,
    ScanInfoLayer,
}

/// Recognized non-hierarchical layer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonHierName {
    #[default]
    Other,
    ScanDataLayer,
    StitchingLayer,
    StitchingIntensityLayer,
    VimslideHistogramData,
}

/// One value of a hierarchical layer.
#[derive(Debug, Clone, Default)]
pub struct HierValue {
    pub name: String,
    pub section: Option<String>,
    /// `Some(n)` when the value is named `ZoomLevel_<n>`.
    pub zoom_level_index: Option<usize>,
}

/// One hierarchical layer.
#[derive(Debug, Clone, Default)]
pub struct HierLayer {
    pub name: HierName,
    pub section: Option<String>,
    pub values: Vec<HierValue>,
}

/// One value of a non-hierarchical layer.
#[derive(Debug, Clone, Default)]
pub struct NonHierValue {
    pub name: String,
    pub section: Option<String>,
    pub is_stitching_intensity_level: bool,
}

/// One non-hierarchical layer.
#[derive(Debug, Clone, Default)]
pub struct NonHierLayer {
    pub name: NonHierName,
    pub section: Option<String>,
    pub values: Vec<NonHierValue>,
}

/// Per-zoom-level parameters from the `ZoomLevel_<n>` sections.
#[derive(Debug, Clone, Default)]
pub struct ZoomLevelInfo {
    pub tile_width: u32,
    pub tile_height: u32,
    pub um_per_pixel_x: f64,
    pub um_per_pixel_y: f64,
    pub fill_color_bgr: u32,
    pub format: MrxsImageFormat,
}

/// Everything the reader needs from Slidedat.ini.
#[derive(Debug, Clone, Default)]
pub struct SlidedatIni {
    pub base_width_in_tiles: u32,
    pub base_height_in_tiles: u32,
    pub slide_version: String,
    pub camera_image_divisions_per_side: u32,
    pub index_dat_filename: String,
    pub dat_filenames: Vec<String>,
    pub hier_layers: Vec<HierLayer>,
    pub nonhier_layers: Vec<NonHierLayer>,
    /// Index into `hier_layers` of the "Slide zoom level" hier.
    pub slide_zoom_level_hier_index: Option<usize>,
    /// Indexed by zoom level.
    pub zoom_levels: Vec<ZoomLevelInfo>,
}

impl SlidedatIni {
    /// Number of pyramid levels declared by the zoom-level hier.
    pub fn zoom_level_count(&self) -> usize {
        self.slide_zoom_level_hier_index
            .map(|i| self.hier_layers[i].values.len())
            .unwrap_or(0)
    }
}

// =============================================================================
// Raw section tokenizer
// =============================================================================

/// Sections in file order, each a list of key/value pairs in file order.
fn tokenize(text: &[u8]) -> Vec<(String, Vec<(String, String)>)> {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for raw_line in text.split(|&b| b == b'\n') {
        // Strip BOM bytes / invalid prefix bytes and surrounding space.
        let mut start = 0;
        while start < raw_line.len() && raw_line[start] >= 128 {
            start += 1;
        }
        let line = String::from_utf8_lossy(&raw_line[start..]);
        let line = line.trim_matches(['\r', ' ', '\t']);
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.trim_start();
            let name = match name.rfind(']') {
                Some(pos) => &name[..pos],
                None => name,
            };
            sections.push((name.to_string(), Vec::new()));
        } else if let Some((key, value)) = line.split_once('=') {
            if let Some((_, pairs)) = sections.last_mut() {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
    }
    sections
}

fn get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn get_u32(pairs: &[(String, String)], key: &str) -> Option<u32> {
    get(pairs, key).and_then(|v| v.parse().ok())
}

// =============================================================================
// Parser
// =============================================================================

/// Parse Slidedat.ini text.
pub fn parse_slidedat_ini(text: &[u8]) -> Result<SlidedatIni, MrxsError> {
    let sections = tokenize(text);
    let by_name: HashMap<&str, &[(String, String)]> = sections
        .iter()
        .map(|(name, pairs)| (name.as_str(), pairs.as_slice()))
        .collect();

    let mut ini = SlidedatIni::default();

    if let Some(general) = by_name.get("GENERAL") {
        ini.base_width_in_tiles = get_u32(general, "IMAGENUMBER_X").unwrap_or(0);
        ini.base_height_in_tiles = get_u32(general, "IMAGENUMBER_Y").unwrap_or(0);
        ini.slide_version = get(general, "CURRENT_SLIDE_VERSION").unwrap_or("").to_string();
        ini.camera_image_divisions_per_side =
            get_u32(general, "CameraImageDivisionsPerSide").unwrap_or(0);
    }

    let hierarchical = by_name
        .get("HIERARCHICAL")
        .ok_or(MrxsError::MissingKey("the HIERARCHICAL section"))?;

    ini.index_dat_filename = get(hierarchical, "INDEXFILE")
        .ok_or(MrxsError::MissingKey("HIERARCHICAL/INDEXFILE"))?
        .to_string();

    // Hier layers and their values.
    let hier_count = get_u32(hierarchical, "HIER_COUNT").unwrap_or(0) as usize;
    for i in 0..hier_count {
        let mut layer = HierLayer::default();
        if let Some(name) = get(hierarchical, &format!("HIER_{}_NAME", i)) {
            layer.name = match name {
                "Slide zoom level" => HierName::SlideZoomLevel,
                "Slide filter level" => HierName::SlideFilterLevel,
                "Microscope focus level" => HierName::MicroscopeFocusLevel,
                "Scan info layer" => HierName::ScanInfoLayer,
                _ => HierName::Other,
            };
            if layer.name == HierName::SlideZoomLevel {
                ini.slide_zoom_level_hier_index = Some(i);
            }
        }
        layer.section = get(hierarchical, &format!("HIER_{}_SECTION", i)).map(String::from);
        let val_count = get_u32(hierarchical, &format!("HIER_{}_COUNT", i)).unwrap_or(0) as usize;
        for j in 0..val_count {
            let mut value = HierValue::default();
            if let Some(name) = get(hierarchical, &format!("HIER_{}_VAL_{}", i, j)) {
                value.name = name.to_string();
                if let Some(level) = name.strip_prefix("ZoomLevel_") {
                    value.zoom_level_index = level.parse().ok();
                }
            }
            value.section =
                get(hierarchical, &format!("HIER_{}_VAL_{}_SECTION", i, j)).map(String::from);
            layer.values.push(value);
        }
        ini.hier_layers.push(layer);
    }

    // Non-hier layers and their values.
    let nonhier_count = get_u32(hierarchical, "NONHIER_COUNT").unwrap_or(0) as usize;
    for i in 0..nonhier_count {
        let mut layer = NonHierLayer::default();
        if let Some(name) = get(hierarchical, &format!("NONHIER_{}_NAME", i)) {
            layer.name = match name {
                "Scan data layer" => NonHierName::ScanDataLayer,
                "StitchingLayer" => NonHierName::StitchingLayer,
                "StitchingIntensityLayer" => NonHierName::StitchingIntensityLayer,
                "VIMSLIDE_HISTOGRAM_DATA" => NonHierName::VimslideHistogramData,
                _ => NonHierName::Other,
            };
        }
        layer.section = get(hierarchical, &format!("NONHIER_{}_SECTION", i)).map(String::from);
        let val_count =
            get_u32(hierarchical, &format!("NONHIER_{}_COUNT", i)).unwrap_or(0) as usize;
        for j in 0..val_count {
            let mut value = NonHierValue::default();
            if let Some(name) = get(hierarchical, &format!("NONHIER_{}_VAL_{}", i, j)) {
                value.name = name.to_string();
                value.is_stitching_intensity_level = layer.name
                    == NonHierName::StitchingIntensityLayer
                    && name == "StitchingIntensityLevel";
            }
            value.section =
                get(hierarchical, &format!("NONHIER_{}_VAL_{}_SECTION", i, j)).map(String::from);
            layer.values.push(value);
        }
        ini.nonhier_layers.push(layer);
    }

    // Data files.
    if let Some(datafile) = by_name.get("DATAFILE") {
        let file_count = get_u32(datafile, "FILE_COUNT").unwrap_or(0) as usize;
        for i in 0..file_count {
            let name = get(datafile, &format!("FILE_{}", i))
                .ok_or(MrxsError::MissingKey("a DATAFILE/FILE_n entry"))?;
            ini.dat_filenames.push(name.to_string());
        }
    }
    if ini.dat_filenames.is_empty() {
        return Err(MrxsError::MissingKey("DATAFILE/FILE_COUNT"));
    }

    // Per-zoom-level sections, resolved through the hier value sections.
    let level_count = ini.zoom_level_count();
    ini.zoom_levels = vec![ZoomLevelInfo::default(); level_count];
    if let Some(hier_index) = ini.slide_zoom_level_hier_index {
        for value in &ini.hier_layers[hier_index].values {
            let (Some(level), Some(section)) = (value.zoom_level_index, value.section.as_deref())
            else {
                continue;
            };
            let Some(pairs) = by_name.get(section) else {
                continue;
            };
            if level < ini.zoom_levels.len() {
                let info = &mut ini.zoom_levels[level];
                info.tile_width = get_u32(pairs, "DIGITIZER_WIDTH").unwrap_or(0);
                info.tile_height = get_u32(pairs, "DIGITIZER_HEIGHT").unwrap_or(0);
                info.um_per_pixel_x = get(pairs, "MICROMETER_PER_PIXEL_X")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                info.um_per_pixel_y = get(pairs, "MICROMETER_PER_PIXEL_Y")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                info.fill_color_bgr = get_u32(pairs, "IMAGE_FILL_COLOR_BGR").unwrap_or(0xFFFFFF);
                info.format = get(pairs, "IMAGE_FORMAT")
                    .map(MrxsImageFormat::parse)
                    .unwrap_or_default();
            }
        }
    }

    Ok(ini)
}

/// A small but complete Slidedat.ini used by unit and integration tests.
#[cfg(test)]
pub(crate) const SAMPLE_INI: &str = "\
[GENERAL]\r\n\
SLIDE_VERSION = 2.2\r\n\
CURRENT_SLIDE_VERSION = 2.2\r\n\
IMAGENUMBER_X = 8\r\n\
IMAGENUMBER_Y = 6\r\n\
CameraImageDivisionsPerSide = 2\r\n\
[HIERARCHICAL]\r\n\
HIER_COUNT = 1\r\n\
NONHIER_COUNT = 1\r\n\
INDEXFILE = Index.dat\r\n\
HIER_0_NAME = Slide zoom level\r\n\
HIER_0_COUNT = 2\r\n\
HIER_0_SECTION = LAYER_0_SECTION\r\n\
HIER_0_VAL_0 = ZoomLevel_0\r\n\
HIER_0_VAL_0_SECTION = ZOOMLEVEL_0_SECTION\r\n\
HIER_0_VAL_1 = ZoomLevel_1\r\n\
HIER_0_VAL_1_SECTION = ZOOMLEVEL_1_SECTION\r\n\
NONHIER_0_NAME = StitchingIntensityLayer\r\n\
NONHIER_0_COUNT = 1\r\n\
NONHIER_0_VAL_0 = StitchingIntensityLevel\r\n\
[DATAFILE]\r\n\
FILE_COUNT = 2\r\n\
FILE_0 = Data0000.dat\r\n\
FILE_1 = Data0001.dat\r\n\
[ZOOMLEVEL_0_SECTION]\r\n\
DIGITIZER_WIDTH = 256\r\n\
DIGITIZER_HEIGHT = 256\r\n\
MICROMETER_PER_PIXEL_X = 0.23\r\n\
MICROMETER_PER_PIXEL_Y = 0.23\r\n\
IMAGE_FILL_COLOR_BGR = 16777215\r\n\
IMAGE_FORMAT = JPEG\r\n\
[ZOOMLEVEL_1_SECTION]\r\n\
DIGITIZER_WIDTH = 256\r\n\
DIGITIZER_HEIGHT = 256\r\n\
MICROMETER_PER_PIXEL_X = 0.46\r\n\
MICROMETER_PER_PIXEL_Y = 0.46\r\n\
IMAGE_FILL_COLOR_BGR = 16777215\r\n\
IMAGE_FORMAT = PNG\r\n\
";
