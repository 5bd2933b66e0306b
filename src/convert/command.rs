//! Converter command construction.
//!
//! Turns a [`ConversionRequest`] and its [`ConversionToken`] into the
//! converter's argument list. Flags already present in the token's queue
//! come first and are never generated a second time.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::addressing::{expand_channels, middle_plane, pages_for_ranges, PlaneRange, Roi};
use crate::error::ConvertError;

use super::capabilities::Capabilities;
use super::request::{ConversionRequest, Operation};
use super::token::ConversionToken;

/// Target size used to pick a pyramid level for histograms.
const HISTOGRAM_TARGET_SIZE: (u32, u32) = (500, 500);

/// List of input files handed to the converter with `-il`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileList {
    pub path: PathBuf,
    pub files: Vec<PathBuf>,
}

impl FileList {
    /// Path of the list file written next to `output`.
    pub fn beside(output: &Path, files: Vec<PathBuf>) -> Self {
        let mut path = output.as_os_str().to_owned();
        path.push(".files");
        Self {
            path: PathBuf::from(path),
            files,
        }
    }

    /// One path per line.
    pub fn contents(&self) -> String {
        self.files
            .iter()
            .map(|f| f.to_string_lossy())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Everything needed to run one converter invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPlan {
    pub args: Vec<String>,

    /// File read-locked while the converter runs
    pub input: PathBuf,

    pub output: Option<PathBuf>,

    /// Written before the converter starts
    pub file_list: Option<FileList>,
}

/// Build the converter command for `request`.
pub fn plan(
    request: &ConversionRequest,
    token: &ConversionToken,
    capabilities: &Capabilities,
) -> Result<CommandPlan, ConvertError> {
    let input = token
        .first_input_file()
        .ok_or_else(|| ConvertError::invalid("token has no input files"))?
        .to_path_buf();

    let output = match (&request.output, request.operation.writes_output()) {
        (Some(output), true) => output.clone(),
        (None, true) => {
            return Err(ConvertError::invalid(format!(
                "{} requires an output path",
                request.operation
            )))
        }
        (_, false) => return Ok(read_query(&request.operation, token, input)),
    };

    let mut builder = Builder::new(token, input, output);
    match &request.operation {
        Operation::Thumbnail {
            width,
            height,
            format,
            method,
        } => builder.thumbnail(*width, *height, format, method)?,
        Operation::Slice {
            z,
            t,
            roi,
            format,
            extended,
        } => builder.slice(*z, *t, *roi, format, extended)?,
        Operation::Tile {
            level,
            x,
            y,
            size,
            format,
        } => builder.tile(*level, *x, *y, *size, format)?,
        Operation::Convert { format, extra } => {
            builder.convert(format.as_deref(), extra, capabilities)?
        }
        Operation::Histogram => builder.histogram()?,
        Operation::Meta | Operation::Info | Operation::Supported => {}
    }
    Ok(builder.finish())
}

fn read_query(operation: &Operation, token: &ConversionToken, input: PathBuf) -> CommandPlan {
    let flag = match operation {
        Operation::Info => "-meta-parsed",
        Operation::Supported => "-supported",
        _ => "-meta",
    };
    let mut args = vec![flag.to_string(), "-i".to_string(), path_arg(&input)];
    if let (Some(series), false) = (token.series(), matches!(operation, Operation::Supported)) {
        args.push("-path".to_string());
        args.push(series.to_string());
    }
    CommandPlan {
        args,
        input,
        output: None,
        file_list: None,
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// =============================================================================
// Builder
// =============================================================================

struct Builder<'a> {
    token: &'a ConversionToken,
    args: Vec<String>,
    /// Flags that must not be generated again
    taken: Vec<String>,
    trailing: Vec<String>,
    input: PathBuf,
    output: PathBuf,
    file_list: Option<FileList>,
}

impl<'a> Builder<'a> {
    fn new(token: &'a ConversionToken, input: PathBuf, output: PathBuf) -> Self {
        Self {
            token,
            args: token.queue().to_vec(),
            taken: token.queue().to_vec(),
            trailing: Vec::new(),
            input,
            output,
            file_list: None,
        }
    }

    fn queued(&self, flag: &str) -> bool {
        self.taken.iter().any(|f| f == flag)
    }

    fn flag_once(&mut self, flag: &str) {
        if !self.queued(flag) {
            self.args.push(flag.to_string());
        }
    }

    fn opt(&mut self, flag: &str, value: impl ToString) {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
    }

    /// Add `flag value` unless the queue already has `flag`.
    fn opt_once(&mut self, flag: &str, value: impl ToString) {
        if !self.queued(flag) {
            self.opt(flag, value);
        }
    }

    fn input_queued(&self) -> bool {
        self.queued("-i") || self.queued("-il")
    }

    fn series_path(&mut self) {
        let token = self.token;
        if let Some(series) = token.series() {
            self.opt_once("-path", series);
        }
    }

    fn output_and_format(&mut self, format: &str) {
        let output = path_arg(&self.output);
        self.opt_once("-o", output);
        self.opt_once("-t", format);
    }

    fn series_file(&self, index: usize) -> Result<&'a Path, ConvertError> {
        let files = self.token.inputs();
        files
            .get(index)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                ConvertError::invalid(format!(
                    "series has {} files, plane index {} is out of range",
                    files.len(),
                    index
                ))
            })
    }

    /// `-i first -c next...` for one plane of a multi-file series.
    fn plane_inputs(&mut self, plane: usize) -> Result<(), ConvertError> {
        if self.input_queued() {
            return Ok(());
        }
        let channels = self.token.series_channels() as usize;
        if channels < 2 {
            let file = self.series_file(plane)?;
            self.input = file.to_path_buf();
            self.opt("-i", path_arg(file));
            return Ok(());
        }

        let first = plane * channels;
        for c in 0..channels {
            let file = self.series_file(first + c)?;
            if c == 0 {
                self.input = file.to_path_buf();
                self.opt("-i", path_arg(file));
            } else {
                self.opt("-c", path_arg(file));
            }
        }
        Ok(())
    }

    fn use_file_list(&mut self, files: Vec<PathBuf>) {
        let list = FileList::beside(&self.output, files);
        if let Some(first) = list.files.first() {
            self.input = first.clone();
        }
        self.opt("-il", path_arg(&list.path));
        self.file_list = Some(list);
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    fn thumbnail(
        &mut self,
        width: u32,
        height: u32,
        format: &str,
        method: &str,
    ) -> Result<(), ConvertError> {
        let dims = self.token.dims();
        self.output_and_format(format);
        self.series_path();

        let plane = middle_plane(dims.counts());
        if let Some(levels) = dims.levels() {
            self.opt_once("-res-level", levels.best_level_for_size(width, height));
        }

        if self.token.is_multifile_series() {
            self.plane_inputs(plane as usize)?;
        } else {
            if !self.input_queued() {
                let input = path_arg(&self.input);
                self.opt("-i", input);
            }
            self.opt_once("-page", plane + 1);
        }

        self.flag_once("-enhancemeta");
        if dims.depth != Some(8) {
            self.opt_once("-depth", "8,d,u");
        }
        self.opt_once("-resize", format!("{},{},{},AR", width, height, method));
        self.flag_once("-fusemeta");
        self.opt_once("-fusemethod", "m");
        if format == "jpeg" {
            self.opt_once("-options", "quality 95 progressive yes");
        }
        Ok(())
    }

    fn slice(
        &mut self,
        z: PlaneRange,
        t: PlaneRange,
        roi: Roi,
        format: &str,
        extended: &[(String, String)],
    ) -> Result<(), ConvertError> {
        let dims = self.token.dims();
        let pages = pages_for_ranges(z, t, dims.counts(), &dims.dimension_order)?;
        self.output_and_format(format);
        self.series_path();

        if !self.token.is_multifile_series() {
            if !self.input_queued() {
                let input = path_arg(&self.input);
                self.opt("-i", input);
            }
            let list = pages
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.opt_once("-page", list);
        } else {
            let channels = self.token.series_channels();
            if pages.len() == 1 && channels <= 1 {
                self.plane_inputs(pages[0] as usize - 1)?;
            } else {
                let indices = if channels > 1 {
                    expand_channels(&pages, channels)
                } else {
                    pages.iter().map(|&p| p as usize - 1).collect()
                };
                let files = indices
                    .into_iter()
                    .map(|i| self.series_file(i).map(Path::to_path_buf))
                    .collect::<Result<Vec<_>, _>>()?;

                let mut geometry = format!("{},1", pages.len());
                if channels > 1 {
                    geometry.push_str(&format!(",{}", channels));
                }
                self.opt_once("-geometry", geometry);
                if !self.input_queued() {
                    self.use_file_list(files);
                }
            }
        }

        if let Some(roi) = roi.to_converter() {
            self.opt_once("-roi", roi.to_arg());
        }

        if !extended.is_empty() {
            let selection = extended
                .iter()
                .map(|(name, value)| format!("{}:{}", name, value))
                .collect::<Vec<_>>()
                .join(",");
            self.opt_once("-slice", selection);
        }
        Ok(())
    }

    fn tile(
        &mut self,
        level: u32,
        x: u32,
        y: u32,
        size: u32,
        format: &str,
    ) -> Result<(), ConvertError> {
        let dims = self.token.dims();
        if !dims.is_tiled() {
            return Err(ConvertError::UnsupportedInput {
                reason: "image has no tiled resolution pyramid".to_string(),
            });
        }
        if size == 0 {
            return Err(ConvertError::invalid("tile size must be positive"));
        }
        if level >= dims.resolution_levels {
            return Err(ConvertError::invalid(format!(
                "level {} out of range, image has {} levels",
                level, dims.resolution_levels
            )));
        }

        self.output_and_format(format);
        self.series_path();

        if !self.input_queued() && !self.queued("-page") {
            if self.token.is_multifile_series() {
                self.plane_inputs(0)?;
            } else {
                let input = path_arg(&self.input);
                self.opt("-i", input);
                self.opt("-page", 1);
            }
        }

        self.opt_once("-tile", format!("{},{},{},{}", size, x, y, level));
        let token = self.token;
        if let Some(speed) = token.speed_file() {
            self.opt_once("-speed", path_arg(speed));
        }
        Ok(())
    }

    fn convert(
        &mut self,
        format: Option<&str>,
        extra: &[String],
        capabilities: &Capabilities,
    ) -> Result<(), ConvertError> {
        self.taken.extend_from_slice(extra);
        self.trailing = extra.to_vec();
        let dims = self.token.dims();

        match self.token.series_meta().copied() {
            None => {
                if !self.input_queued() {
                    let input = path_arg(&self.input);
                    self.opt("-i", input);
                }
            }
            Some(meta) => {
                if !self.input_queued() {
                    self.use_file_list(self.token.inputs().to_vec());
                }

                let mut geometry = format!("{},{}", meta.z, meta.t);
                if meta.channels > 1 {
                    geometry.push_str(&format!(",{}", meta.channels));
                }
                self.opt_once("-geometry", geometry);

                let [rx, ry, rz, rt] = dims.pixel_resolution;
                self.opt_once("-resolution", format!("{},{},{},{}", rx, ry, rz, rt));
            }
        }

        self.series_path();

        let token = self.token;
        if let Some(histogram) = token.histogram() {
            self.opt_once("-ihst", path_arg(histogram));
        }
        let output = path_arg(&self.output);
        self.opt_once("-o", output);

        if let Some(format) = format {
            let info = capabilities
                .format(format)
                .ok_or_else(|| ConvertError::UnsupportedInput {
                    reason: format!("converter cannot write format '{}'", format),
                })?;
            self.opt_once("-t", format);
            if !info.multipage && !self.queued("-page") && dims.counts().planes() > 1 {
                self.opt("-page", 1);
            }
        }
        Ok(())
    }

    fn histogram(&mut self) -> Result<(), ConvertError> {
        let dims = self.token.dims();
        let output = path_arg(&self.output);
        self.opt_once("-ohst", output);
        self.series_path();

        if !self.input_queued() {
            if self.token.is_multifile_series() {
                self.plane_inputs(0)?;
            } else {
                let input = path_arg(&self.input);
                self.opt("-i", input);
            }
        }

        if let Some(levels) = dims.levels() {
            let (w, h) = HISTOGRAM_TARGET_SIZE;
            self.opt_once("-res-level", levels.best_level_for_size(w, h));
        }
        Ok(())
    }

    fn finish(mut self) -> CommandPlan {
        self.args.append(&mut self.trailing);
        CommandPlan {
            args: self.args,
            input: self.input,
            output: Some(self.output),
            file_list: self.file_list,
        }
    }
}
