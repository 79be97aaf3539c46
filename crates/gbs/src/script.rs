//! Block-structured test scripts.
//!
//! A script is split into blocks at every line starting with `---`. The first
//! line of a block names its tag and arguments; the rest is its body:
//!
//! ```text
//! !data
//! sources: {"a.c": {main: true}}
//! ---
//! !rawsource after
//! int main(void) { studentMain(); printf("{{{FINISHED}}}\n"); }
//! --- !logic sentinel is printed
//! c = Compilation(after_main=after)
//! c.compile()
//! out = c.run()
//! assert c.flag in out.stdout
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use gbs_host_runner::{red, CheckError};
use log::{error, info, warn};

use crate::env::Environment;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    RawSource,
    Logic,
    Inherit,
}

impl BlockKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.strip_prefix('!').unwrap_or(tag) {
            "data" | "yaml" => Some(BlockKind::Data),
            "rawsource" | "source" => Some(BlockKind::RawSource),
            "logic" => Some(BlockKind::Logic),
            "inherit" => Some(BlockKind::Inherit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub args: Vec<String>,
    pub body: String,
    /// Position within its file, counting from 0.
    pub index: usize,
}

impl Block {
    /// Human-readable sub-test label: the block's arguments.
    pub fn label(&self) -> Option<String> {
        (!self.args.is_empty()).then(|| self.args.join(" "))
    }
}

pub fn split_blocks(text: &str) -> Result<Vec<Block>> {
    let mut chunks: Vec<String> = vec![String::new()];
    for line in text.split_inclusive('\n') {
        match line.strip_prefix("---") {
            Some(rest) => chunks.push(rest.to_string()),
            None => {
                if let Some(cur) = chunks.last_mut() {
                    cur.push_str(line);
                }
            }
        }
    }

    let mut blocks = Vec::new();
    for chunk in chunks {
        let chunk = chunk.trim_start();
        if chunk.is_empty() {
            continue;
        }
        let (header, body) = chunk.split_once('\n').unwrap_or((chunk, ""));
        let mut words = header.split_whitespace();
        let tag = words.next().unwrap_or_default();
        let Some(kind) = BlockKind::from_tag(tag) else {
            bail!("Block type {tag} is unknown");
        };
        blocks.push(Block {
            kind,
            args: words.map(str::to_string).collect(),
            body: body.to_string(),
            index: blocks.len(),
        });
    }
    Ok(blocks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Pass,
    Fail,
    Skip,
}

/// What a logic block sees while it runs.
pub struct LogicContext<'a> {
    pub env: &'a mut Environment,
    pub session: &'a mut Session,
    /// Directory of the script being executed.
    pub script_dir: &'a Path,
}

/// Executes the body of `logic` blocks.
pub trait LogicRunner {
    fn run_logic(&mut self, cx: &mut LogicContext<'_>, block: &Block) -> Result<(), CheckError>;
}

pub type NativeFn = Box<dyn FnMut(&mut LogicContext<'_>) -> Result<(), CheckError>>;

/// Logic blocks implemented as registered closures, looked up by the block's
/// label first and by its position (`index`) second.
#[derive(Default)]
pub struct NativeLogic {
    by_label: BTreeMap<String, NativeFn>,
    by_index: BTreeMap<usize, NativeFn>,
}

impl NativeLogic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_label<F>(mut self, label: &str, f: F) -> Self
    where
        F: FnMut(&mut LogicContext<'_>) -> Result<(), CheckError> + 'static,
    {
        self.by_label.insert(label.to_string(), Box::new(f));
        self
    }

    pub fn on_index<F>(mut self, index: usize, f: F) -> Self
    where
        F: FnMut(&mut LogicContext<'_>) -> Result<(), CheckError> + 'static,
    {
        self.by_index.insert(index, Box::new(f));
        self
    }
}

impl LogicRunner for NativeLogic {
    fn run_logic(&mut self, cx: &mut LogicContext<'_>, block: &Block) -> Result<(), CheckError> {
        let by_label = block.label().and_then(|l| self.by_label.get_mut(&l));
        let f = match by_label {
            Some(f) => f,
            None => self.by_index.get_mut(&block.index).ok_or_else(|| {
                CheckError::defect(format!(
                    "no native logic registered for block #{} ({})",
                    block.index,
                    block.label().unwrap_or_default()
                ))
            })?,
        };
        f(cx)
    }
}

/// A loaded and executed test file.
#[derive(Debug)]
pub struct TestScript {
    path: PathBuf,
    env: Environment,
    failed: bool,
    skipped: u32,
}

impl TestScript {
    /// Reads `path` and executes it block by block.
    ///
    /// Hard failures and skips are recorded on the returned script; an `Err`
    /// means the harness itself or the file's structure is broken.
    pub fn run_file(
        path: &Path,
        session: &mut Session,
        runner: &mut dyn LogicRunner,
    ) -> Result<TestScript> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read testcase: {}", path.display()))?;
        Self::run_source(path, &text, session, runner)
    }

    /// Like [`TestScript::run_file`] with the content already in memory;
    /// `path` anchors `inherit` blocks and relative sources.
    pub fn run_source(
        path: &Path,
        text: &str,
        session: &mut Session,
        runner: &mut dyn LogicRunner,
    ) -> Result<TestScript> {
        let mut script = TestScript {
            path: path.to_path_buf(),
            env: Environment::new(),
            failed: false,
            skipped: 0,
        };
        let mut loader = Loader {
            session,
            runner,
            stack: vec![normalize(path)],
        };
        loader.load(&mut script, path, text, true)?;
        Ok(script)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

struct Loader<'a> {
    session: &'a mut Session,
    runner: &'a mut dyn LogicRunner,
    /// Files currently being loaded, to reject inheritance cycles.
    stack: Vec<PathBuf>,
}

impl Loader<'_> {
    fn load(&mut self, script: &mut TestScript, path: &Path, text: &str, execute: bool) -> Result<()> {
        let blocks =
            split_blocks(text).with_context(|| format!("parse testcase: {}", path.display()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

        for block in &blocks {
            match block.kind {
                BlockKind::Data => {
                    let map = parse_data_block(&block.body).with_context(|| {
                        format!("{}: data block #{}", path.display(), block.index)
                    })?;
                    script.env.merge(map);
                }
                BlockKind::RawSource => {
                    let Some(name) = block.args.first() else {
                        bail!(
                            "{}: rawsource block #{} needs a variable name",
                            path.display(),
                            block.index
                        );
                    };
                    script
                        .env
                        .set(name.trim(), serde_json::Value::String(block.body.clone()).into());
                }
                BlockKind::Inherit => {
                    let Some(other) = block.args.first() else {
                        bail!(
                            "{}: inherit block #{} needs a file name",
                            path.display(),
                            block.index
                        );
                    };
                    let other_path = dir.join(other);
                    let key = normalize(&other_path);
                    if self.stack.contains(&key) {
                        bail!("inheritance cycle through {}", other_path.display());
                    }
                    let other_text = std::fs::read_to_string(&other_path)
                        .with_context(|| format!("read inherited testcase: {}", other_path.display()))?;
                    self.stack.push(key);
                    self.load(script, &other_path, &other_text, false)?;
                    self.stack.pop();
                }
                BlockKind::Logic => {
                    if !execute {
                        continue;
                    }
                    if let Some(label) = block.label() {
                        info!("... Subtest: {label}");
                    }
                    match self.run_logic(script, &dir, block)? {
                        BlockOutcome::Pass => {}
                        BlockOutcome::Skip => script.skipped += 1,
                        BlockOutcome::Fail => {
                            script.failed = true;
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn run_logic(&mut self, script: &mut TestScript, dir: &Path, block: &Block) -> Result<BlockOutcome> {
        let mut cx = LogicContext {
            env: &mut script.env,
            session: self.session,
            script_dir: dir,
        };
        match self.runner.run_logic(&mut cx, block) {
            Ok(()) => Ok(BlockOutcome::Pass),
            Err(CheckError::Hard { message }) => {
                error!("testcase failed: {}, {message}", script.path.display());
                Ok(BlockOutcome::Fail)
            }
            Err(CheckError::Timeout {
                message,
                stdout,
                stderr,
            }) => {
                error!(
                    "testcase failed by timeout: {}, {message}",
                    script.path.display()
                );
                error!("STDOUT:\n{stdout}\nSTDERR:\n{}", red(&stderr));
                Ok(BlockOutcome::Fail)
            }
            Err(CheckError::Skip { message }) => {
                warn!("{message}");
                Ok(BlockOutcome::Skip)
            }
            Err(CheckError::Defect(err)) => Err(err.context(format!(
                "{}: logic block #{}",
                script.path.display(),
                block.index
            ))),
        }
    }
}

fn parse_data_block(body: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(body).context("invalid YAML")?;
    match serde_json::to_value(yaml).context("YAML is not representable as data")? {
        serde_json::Value::Null => Ok(serde_json::Map::new()),
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("data block must be a mapping, got {other}"),
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_separator_lines() {
        let text = "!data\na: 1\n---\n!rawsource src\nint x;\n--- !logic first check\nassert a == 1\n";
        let blocks = split_blocks(text).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].kind, BlockKind::Data);
        assert_eq!(blocks[0].body, "a: 1\n");
        assert_eq!(blocks[1].kind, BlockKind::RawSource);
        assert_eq!(blocks[1].args, vec!["src"]);
        assert_eq!(blocks[1].body, "int x;\n");
        assert_eq!(blocks[2].kind, BlockKind::Logic);
        assert_eq!(blocks[2].label().as_deref(), Some("first check"));
        assert_eq!(blocks[2].index, 2);
    }

    #[test]
    fn tags_accept_aliases_without_bang() {
        let blocks = split_blocks("yaml\n---\nsource s\n---\ninherit base.test\n").unwrap();
        let kinds: Vec<BlockKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::Data, BlockKind::RawSource, BlockKind::Inherit]
        );
    }

    #[test]
    fn leading_and_empty_blocks_are_dropped() {
        let blocks = split_blocks("\n\n---\n---\n\n!data\nx: 1").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].body, "x: 1");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = split_blocks("!python\nprint(1)\n").unwrap_err();
        assert!(err.to_string().contains("!python"), "{err}");
    }

    #[test]
    fn data_blocks_must_be_mappings() {
        assert!(parse_data_block("- 1\n- 2\n").is_err());
        assert!(parse_data_block("").unwrap().is_empty());
        let map = parse_data_block("sources: {\"a.c\": {main: true}}\ncflags: [-Wall]\n").unwrap();
        assert_eq!(map["sources"]["a.c"]["main"], serde_json::json!(true));
        assert_eq!(map["cflags"], serde_json::json!(["-Wall"]));
    }
}
