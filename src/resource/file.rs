//! File resources - rendered files, directories, line edits and fetches

use anyhow::{Context, Result, bail};
use declarative::{
    ApplyContext, ApplyResult, FactProbe, FileSpec, Operation, ProbeError, ProbeState,
    normalize_mode,
};
use regex::Regex;
use std::fs;
use std::path::PathBuf;

use super::describe_content;

/// Compare mode/owner/group a spec asks for against what the host has
fn attribute_drift(
    spec: &FileSpec,
    mode: Option<&str>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Option<(String, String)> {
    let mut current = Vec::new();
    let mut desired = Vec::new();

    if let Some(want) = &spec.mode {
        let have = mode.map(normalize_mode).unwrap_or_default();
        if have != normalize_mode(want) {
            current.push(format!("mode {}", have));
            desired.push(format!("mode {}", normalize_mode(want)));
        }
    }
    for (label, want, have) in [
        ("owner", &spec.owner, owner),
        ("group", &spec.group, group),
    ] {
        if let Some(want) = want
            && have.is_some_and(|h| h != want)
        {
            current.push(format!("{} {}", label, have.unwrap_or_default()));
            desired.push(format!("{} {}", label, want));
        }
    }

    (!desired.is_empty()).then(|| (current.join(", "), desired.join(", ")))
}

// ============================================================================
// FileContent
// ============================================================================

/// A file with exact content
#[derive(Debug, Clone)]
pub struct FileContent {
    pub spec: FileSpec,
    pub content: String,
    /// Copy an existing file to `<path>.bak` before rewriting it
    pub backup: bool,
}

impl FileContent {
    pub fn new(spec: FileSpec, content: impl Into<String>) -> Self {
        Self {
            spec,
            content: content.into(),
            backup: false,
        }
    }

    /// Keep a `.bak` copy of the previous content
    pub fn with_backup(mut self) -> Self {
        self.backup = true;
        self
    }
}

impl Operation for FileContent {
    fn id(&self) -> String {
        format!("file:{}", self.spec.path)
    }

    fn description(&self) -> String {
        format!("Write {}", self.spec.path)
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(file) = facts.file(&self.spec.path)? else {
            return Ok(ProbeState::Absent);
        };

        if file.content != self.content.as_bytes() {
            return Ok(ProbeState::differs(
                describe_content(&file.content),
                describe_content(self.content.as_bytes()),
            ));
        }

        Ok(
            match attribute_drift(
                &self.spec,
                file.mode.as_deref(),
                file.owner.as_deref(),
                file.group.as_deref(),
            ) {
                Some((current, desired)) => ProbeState::Differs { current, desired },
                None => ProbeState::Matches,
            },
        )
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        if self.backup {
            ctx.host.backup_file(&self.spec.path)?;
        }
        ctx.host
            .write_file(&self.spec, self.content.as_bytes())
            .with_context(|| format!("Failed to write {}", self.spec.path))?;
        Ok(ApplyResult::Changed)
    }
}

// ============================================================================
// Directory
// ============================================================================

/// A directory with optional mode and ownership
#[derive(Debug, Clone)]
pub struct Directory {
    pub spec: FileSpec,
}

impl Directory {
    pub fn new(spec: FileSpec) -> Self {
        Self { spec }
    }
}

impl Operation for Directory {
    fn id(&self) -> String {
        format!("directory:{}", self.spec.path)
    }

    fn description(&self) -> String {
        format!("Create directory {}", self.spec.path)
    }

    fn kind(&self) -> &'static str {
        "directory"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(dir) = facts.directory(&self.spec.path)? else {
            return Ok(ProbeState::Absent);
        };
        Ok(
            match attribute_drift(
                &self.spec,
                dir.mode.as_deref(),
                dir.owner.as_deref(),
                dir.group.as_deref(),
            ) {
                Some((current, desired)) => ProbeState::Differs { current, desired },
                None => ProbeState::Matches,
            },
        )
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.create_directory(&self.spec)?;
        Ok(ApplyResult::Changed)
    }
}

// ============================================================================
// LineInFile
// ============================================================================

/// A single line that must be present in a file
///
/// When `replace` is set, the first line matching that pattern is rewritten
/// in place; otherwise the line is appended. A missing file is created.
#[derive(Debug, Clone)]
pub struct LineInFile {
    pub spec: FileSpec,
    pub line: String,
    pub replace: Option<Regex>,
    pub backup: bool,
}

impl LineInFile {
    pub fn new(spec: FileSpec, line: impl Into<String>) -> Self {
        Self {
            spec,
            line: line.into(),
            replace: None,
            backup: false,
        }
    }

    /// Rewrite the first line matching `pattern` instead of appending
    pub fn replacing(mut self, pattern: Regex) -> Self {
        self.replace = Some(pattern);
        self
    }

    pub fn with_backup(mut self) -> Self {
        self.backup = true;
        self
    }

    /// Content after ensuring the line
    fn render(&self, current: &str) -> String {
        if current.lines().any(|l| l == self.line) {
            return current.to_string();
        }

        if let Some(pattern) = &self.replace
            && current.lines().any(|l| pattern.is_match(l))
        {
            let mut replaced = false;
            let mut lines: Vec<&str> = Vec::new();
            for line in current.lines() {
                if !replaced && pattern.is_match(line) {
                    lines.push(&self.line);
                    replaced = true;
                } else {
                    lines.push(line);
                }
            }
            let mut out = lines.join("\n");
            out.push('\n');
            return out;
        }

        let mut out = current.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.line);
        out.push('\n');
        out
    }
}

impl Operation for LineInFile {
    fn id(&self) -> String {
        format!("line:{}:{}", self.spec.path, self.line)
    }

    fn description(&self) -> String {
        format!("Ensure line in {}: {}", self.spec.path, self.line)
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(file) = facts.file(&self.spec.path)? else {
            return Ok(ProbeState::Absent);
        };
        let text = file.text();
        if text.lines().any(|l| l == self.line) {
            return Ok(ProbeState::Matches);
        }
        let current = self
            .replace
            .as_ref()
            .and_then(|p| text.lines().find(|l| p.is_match(l)))
            .unwrap_or("(missing)");
        Ok(ProbeState::differs(current, self.line.clone()))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let current = ctx.facts.file(&self.spec.path)?.map(|f| f.text());
        let rendered = self.render(current.as_deref().unwrap_or_default());
        if current.as_deref() == Some(rendered.as_str()) {
            return Ok(ApplyResult::Unchanged);
        }
        if self.backup && current.is_some() {
            ctx.host.backup_file(&self.spec.path)?;
        }
        ctx.host.write_file(&self.spec, rendered.as_bytes())?;
        Ok(ApplyResult::Changed)
    }
}

// ============================================================================
// FileReplace
// ============================================================================

/// Regex substitution over an existing file
#[derive(Debug, Clone)]
pub struct FileReplace {
    pub spec: FileSpec,
    pub pattern: Regex,
    pub replacement: String,
}

impl FileReplace {
    pub fn new(spec: FileSpec, pattern: Regex, replacement: impl Into<String>) -> Self {
        Self {
            spec,
            pattern,
            replacement: replacement.into(),
        }
    }

    fn render(&self, current: &str) -> String {
        self.pattern
            .replace_all(current, regex::NoExpand(&self.replacement))
            .into_owned()
    }
}

impl Operation for FileReplace {
    fn id(&self) -> String {
        format!("replace:{}:{}", self.spec.path, self.pattern.as_str())
    }

    fn description(&self) -> String {
        format!(
            "Replace '{}' in {} with '{}'",
            self.pattern.as_str(),
            self.spec.path,
            self.replacement
        )
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(file) = facts.file(&self.spec.path)? else {
            return Ok(ProbeState::Absent);
        };
        let text = file.text();
        let rendered = self.render(&text);
        if rendered == text {
            Ok(ProbeState::Matches)
        } else {
            Ok(ProbeState::differs(
                describe_content(text.as_bytes()),
                describe_content(rendered.as_bytes()),
            ))
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let Some(file) = ctx.facts.file(&self.spec.path)? else {
            bail!("{} does not exist", self.spec.path);
        };
        let text = file.text();
        let rendered = self.render(&text);
        if rendered == text {
            return Ok(ApplyResult::Unchanged);
        }
        ctx.host.write_file(&self.spec, rendered.as_bytes())?;
        Ok(ApplyResult::Changed)
    }
}

// ============================================================================
// FetchFile
// ============================================================================

/// Copy a remote file to the operator's machine
#[derive(Debug, Clone)]
pub struct FetchFile {
    pub remote: String,
    pub local: PathBuf,
}

impl FetchFile {
    pub fn new(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }
}

impl Operation for FetchFile {
    fn id(&self) -> String {
        format!("fetch:{}", self.remote)
    }

    fn description(&self) -> String {
        format!("Fetch {} to {}", self.remote, self.local.display())
    }

    fn kind(&self) -> &'static str {
        "fetch"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(remote) = facts.file(&self.remote)? else {
            return Ok(ProbeState::Absent);
        };
        Ok(match fs::read(&self.local) {
            Ok(local) if local == remote.content => ProbeState::Matches,
            Ok(local) => ProbeState::differs(
                describe_content(&local),
                describe_content(&remote.content),
            ),
            Err(_) => ProbeState::Absent,
        })
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let Some(remote) = ctx.facts.file(&self.remote)? else {
            bail!("{} does not exist on the host", self.remote);
        };
        if let Some(parent) = self.local.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.local, &remote.content)
            .with_context(|| format!("Failed to write {}", self.local.display()))?;
        Ok(ApplyResult::Changed)
    }
}
