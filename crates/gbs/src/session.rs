use std::collections::BTreeMap;

use gbs_host_runner::{
    Capabilities, CheckError, Compilation, HostConfig, RunOptions, RunOutput, StraceOutput, Trace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompilationId(usize);

/// Owns every compilation created while running test scripts, together with
/// the toolchain configuration and the optional-tool availability state.
///
/// Scripts only hold [`CompilationId`]s; the run loop calls
/// [`Session::cleanup_all`] once all scripts are done.
#[derive(Debug)]
pub struct Session {
    config: HostConfig,
    caps: Capabilities,
    compilations: Vec<Compilation>,
}

impl Session {
    pub fn new(config: HostConfig) -> Self {
        Session {
            config,
            caps: Capabilities::default(),
            compilations: Vec::new(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn register(&mut self, compilation: Compilation) -> CompilationId {
        self.compilations.push(compilation);
        CompilationId(self.compilations.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.compilations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compilations.is_empty()
    }

    pub fn get(&self, id: CompilationId) -> Result<&Compilation, CheckError> {
        self.compilations
            .get(id.0)
            .ok_or_else(|| CheckError::defect(format!("stale compilation handle {}", id.0)))
    }

    fn get_mut(&mut self, id: CompilationId) -> Result<&mut Compilation, CheckError> {
        self.compilations
            .get_mut(id.0)
            .ok_or_else(|| CheckError::defect(format!("stale compilation handle {}", id.0)))
    }

    pub fn compile(
        &mut self,
        id: CompilationId,
        flags: &[String],
        remap: &BTreeMap<String, String>,
    ) -> Result<(), CheckError> {
        let Session {
            config,
            compilations,
            ..
        } = self;
        compilations
            .get_mut(id.0)
            .ok_or_else(|| CheckError::defect(format!("stale compilation handle {}", id.0)))?
            .compile(flags, remap, config)
    }

    pub fn run(&self, id: CompilationId, opts: &RunOptions) -> Result<RunOutput, CheckError> {
        self.get(id)?.run(opts, &self.config)
    }

    pub fn trace(
        &mut self,
        id: CompilationId,
        functions: &[String],
        opts: RunOptions,
    ) -> Result<Trace, CheckError> {
        let c = self
            .compilations
            .get(id.0)
            .ok_or_else(|| CheckError::defect(format!("stale compilation handle {}", id.0)))?;
        c.trace(functions, opts, &self.config, &mut self.caps)
    }

    pub fn strace(
        &mut self,
        id: CompilationId,
        syscalls: Option<&str>,
        opts: RunOptions,
    ) -> Result<StraceOutput, CheckError> {
        let c = self
            .compilations
            .get(id.0)
            .ok_or_else(|| CheckError::defect(format!("stale compilation handle {}", id.0)))?;
        c.strace(syscalls, opts, &self.config, &mut self.caps)
    }

    pub fn cleanup(&mut self, id: CompilationId) -> Result<(), CheckError> {
        self.get_mut(id)?.cleanup();
        Ok(())
    }

    /// Releases every working directory still alive; returns how many were.
    pub fn cleanup_all(&mut self) -> usize {
        let mut released = 0;
        for c in &mut self.compilations {
            if !c.is_cleaned() {
                c.cleanup();
                released += 1;
            }
        }
        released
    }
}
