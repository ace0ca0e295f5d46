//! Operation registry: which program runs for which operation, with which
//! arguments, and where its output lands.
//!
//! Templates are argument *vectors*. Placeholders (`{input}`, `{output}`,
//! `{format}`, `{width}`, `{height}`) are substituted inside each element
//! independently and the result is handed to the OS as-is, so a parameter can
//! never be reinterpreted as extra arguments or shell syntax.

use crate::config::ExecutorPrograms;
use crate::error::FileProcError;
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

/// Longest accepted target format token.
const MAX_FORMAT_LEN: usize = 16;

/// The four supported transformations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    CompressPdf,
    ConvertToTxt,
    ConvertImageFormat,
    ResizeImage,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::CompressPdf,
        Operation::ConvertToTxt,
        Operation::ConvertImageFormat,
        Operation::ResizeImage,
    ];

    /// Method name on the wire; also the log component name.
    pub fn rpc_name(&self) -> &'static str {
        match self {
            Operation::CompressPdf => "CompressPDF",
            Operation::ConvertToTxt => "ConvertToTXT",
            Operation::ConvertImageFormat => "ConvertImageFormat",
            Operation::ResizeImage => "ResizeImage",
        }
    }

    /// Prefix of the input artifact's file name.
    pub fn staging_prefix(&self) -> &'static str {
        match self {
            Operation::CompressPdf => "input_compress",
            Operation::ConvertToTxt => "input_totext",
            Operation::ConvertImageFormat => "input_convert",
            Operation::ResizeImage => "input_resize",
        }
    }

    /// Whether the inbound stream must open with a parameter message.
    pub fn is_parameterized(&self) -> bool {
        matches!(
            self,
            Operation::ConvertImageFormat | Operation::ResizeImage
        )
    }

    fn index(&self) -> usize {
        match self {
            Operation::CompressPdf => 0,
            Operation::ConvertToTxt => 1,
            Operation::ConvertImageFormat => 2,
            Operation::ResizeImage => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rpc_name())
    }
}

/// A validated target image format, e.g. `png`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFormat(String);

impl TargetFormat {
    /// Accepts 1–16 ASCII alphanumerics; the result is lower-cased.
    ///
    /// The format becomes the output file's extension and is read by the
    /// collaborator as a format hint, so separators, dots and `:` prefixes are
    /// rejected.
    pub fn parse(raw: &str) -> Result<Self, FileProcError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FileProcError::InvalidArgument(
                "output_format must not be empty".into(),
            ));
        }
        if trimmed.len() > MAX_FORMAT_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FileProcError::InvalidArgument(format!(
                "output_format {raw:?} must be 1–{MAX_FORMAT_LEN} ASCII letters or digits"
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validated resize geometry; both sides strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: i32, height: i32) -> Result<Self, FileProcError> {
        if width <= 0 || height <= 0 {
            return Err(FileProcError::InvalidArgument(format!(
                "dimensions must be positive, got {width}x{height}"
            )));
        }
        Ok(Self {
            width: width as u32,
            height: height as u32,
        })
    }
}

/// One operation together with its validated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    CompressPdf,
    ConvertToTxt,
    ConvertImageFormat(TargetFormat),
    ResizeImage(Geometry),
}

impl Job {
    pub fn operation(&self) -> Operation {
        match self {
            Job::CompressPdf => Operation::CompressPdf,
            Job::ConvertToTxt => Operation::ConvertToTxt,
            Job::ConvertImageFormat(_) => Operation::ConvertImageFormat,
            Job::ResizeImage(_) => Operation::ResizeImage,
        }
    }

    fn format(&self) -> Option<&str> {
        match self {
            Job::ConvertImageFormat(f) => Some(f.as_str()),
            _ => None,
        }
    }

    fn geometry(&self) -> Option<Geometry> {
        match self {
            Job::ResizeImage(g) => Some(*g),
            _ => None,
        }
    }
}

/// Program plus argument template for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl InvocationTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Output path rule: the input path with `suffix` appended.
///
/// `suffix` may use `{format}`, e.g. `_out.{format}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRule {
    pub suffix: String,
}

impl OutputRule {
    pub fn suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

/// Registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredOperation {
    pub template: InvocationTemplate,
    pub output: OutputRule,
}

/// A fully rendered collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub operation: Operation,
    pub program: OsString,
    pub args: Vec<OsString>,
    pub output_path: PathBuf,
}

/// Maps every [`Operation`] to its collaborator template and output rule.
#[derive(Debug, Clone)]
pub struct OperationRegistry {
    entries: [RegisteredOperation; 4],
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(&ExecutorPrograms::default())
    }
}

impl OperationRegistry {
    /// Registry with the stock Ghostscript / pdftotext / ImageMagick templates.
    pub fn new(programs: &ExecutorPrograms) -> Self {
        let compress = RegisteredOperation {
            template: InvocationTemplate::new(
                programs.ghostscript.clone(),
                [
                    "-sDEVICE=pdfwrite",
                    "-dCompatibilityLevel=1.4",
                    "-dPDFSETTINGS=/ebook",
                    "-dNOPAUSE",
                    "-dQUIET",
                    "-dBATCH",
                    "-sOutputFile={output}",
                    "{input}",
                ],
            ),
            output: OutputRule::suffix("_out.pdf"),
        };
        let to_text = RegisteredOperation {
            template: InvocationTemplate::new(programs.pdftotext.clone(), ["{input}", "{output}"]),
            output: OutputRule::suffix("_out.txt"),
        };
        let convert = RegisteredOperation {
            template: InvocationTemplate::new(
                programs.imagemagick.clone(),
                ["{input}", "{output}"],
            ),
            output: OutputRule::suffix("_out.{format}"),
        };
        let resize = RegisteredOperation {
            template: InvocationTemplate::new(
                programs.imagemagick.clone(),
                ["{input}", "-resize", "{width}x{height}!", "{output}"],
            ),
            output: OutputRule::suffix("_out"),
        };
        Self {
            entries: [compress, to_text, convert, resize],
        }
    }

    /// Replace the entry for `operation`.
    ///
    /// The output suffix must keep the output a sibling of the input, so a
    /// suffix containing a path separator is rejected and the old entry kept.
    pub fn register(
        &mut self,
        operation: Operation,
        entry: RegisteredOperation,
    ) -> Result<&mut Self, FileProcError> {
        let suffix = &entry.output.suffix;
        if suffix.contains('/') || suffix.contains('\\') {
            return Err(FileProcError::InvalidConfig(format!(
                "{operation}: output suffix {suffix:?} is not a plain file name"
            )));
        }
        self.entries[operation.index()] = entry;
        Ok(self)
    }

    pub fn get(&self, operation: Operation) -> &RegisteredOperation {
        &self.entries[operation.index()]
    }

    /// Derive the output path for `job` run against `input`: a sibling of the
    /// input in the same directory.
    pub fn output_path(&self, job: &Job, input: &Path) -> PathBuf {
        let entry = self.get(job.operation());
        let suffix = render(&entry.output.suffix, &Vars::for_job(job, None, None));
        let mut name = input.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Render the collaborator call for `job` against `input`.
    pub fn invocation(&self, job: &Job, input: &Path) -> Invocation {
        let output_path = self.output_path(job, input);
        let entry = self.get(job.operation());
        let vars = Vars::for_job(job, Some(input.as_os_str()), Some(output_path.as_os_str()));
        let args = entry
            .template
            .args
            .iter()
            .map(|arg| render(arg, &vars))
            .collect();
        Invocation {
            operation: job.operation(),
            program: OsString::from(&entry.template.program),
            args,
            output_path,
        }
    }
}

struct Vars<'a> {
    input: Option<&'a OsStr>,
    output: Option<&'a OsStr>,
    format: Option<String>,
    width: Option<String>,
    height: Option<String>,
}

impl<'a> Vars<'a> {
    fn for_job(job: &Job, input: Option<&'a OsStr>, output: Option<&'a OsStr>) -> Self {
        let geometry = job.geometry();
        Self {
            input,
            output,
            format: job.format().map(str::to_string),
            width: geometry.map(|g| g.width.to_string()),
            height: geometry.map(|g| g.height.to_string()),
        }
    }

    fn lookup(&self, name: &str) -> Option<OsString> {
        match name {
            "input" => self.input.map(OsStr::to_os_string),
            "output" => self.output.map(OsStr::to_os_string),
            "format" => self.format.as_ref().map(OsString::from),
            "width" => self.width.as_ref().map(OsString::from),
            "height" => self.height.as_ref().map(OsString::from),
            _ => None,
        }
    }
}

/// Substitute `{name}` placeholders in one template element.
///
/// Unknown or unset placeholders are kept literally.
fn render(template: &str, vars: &Vars<'_>) -> OsString {
    let mut out = OsString::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match vars.lookup(name) {
                    Some(value) => out.push(value),
                    None => {
                        out.push("{");
                        out.push(name);
                        out.push("}");
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push(rest);
    out
}
