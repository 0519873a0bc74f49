//! Turning generated kernel source into a callable native function.
//!
//! Artifacts are content addressed: the module path is derived from a hash of
//! the source, the compiler and its flags. An existing module is reused, and
//! every fresh build lands under its own temporary name before being renamed
//! into place.

use std::{
    ffi::c_int,
    fs,
    hash::{DefaultHasher, Hash, Hasher},
    io::Write,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use libloading::Library;
use tracing::{debug, info};

use crate::{
    codegen::{KernelSource, KERNEL_SYMBOL},
    config::JitConfig,
    planner::MemoryPlan,
    Context, Error, Result,
};

pub mod toolchain;

/// Signature of the exported kernel: `(buffer, row_count)`.
pub type KernelFn = unsafe extern "C" fn(*mut f32, c_int);

/// A loaded shared module. Dropping it unloads the module.
#[derive(Debug)]
pub struct NativeModule {
    lib: Library,
    path: PathBuf,
}

impl NativeModule {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // SAFETY: the module is one of our generated kernels, which run no
        // initialisers.
        let lib = unsafe { Library::new(&path) }.map_err(|err| {
            Error::LoadFailure {
                path: path.clone(),
                reason: err.to_string(),
            }
            .bt()
        })?;
        debug!(path = %path.display(), "loaded kernel module");
        Ok(Self { lib, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up `symbol`, which must have the [`KernelFn`] signature.
    pub fn resolve(&self, symbol: &str) -> Result<EntryPoint<'_>> {
        // SAFETY: every module we build exports its kernel with `KernelFn`'s
        // signature; the returned entry point borrows the module so it cannot
        // outlive it.
        let func = unsafe {
            self.lib
                .get::<KernelFn>(symbol.as_bytes())
                .map(|sym| *sym)
        }
        .map_err(|err| {
            Error::SymbolResolutionFailure {
                symbol: symbol.to_string(),
                path: self.path.clone(),
                reason: err.to_string(),
            }
            .bt()
        })?;
        Ok(EntryPoint {
            func,
            _module: PhantomData,
        })
    }

    /// Unload the module, reporting failures instead of ignoring them on drop.
    pub fn unload(self) -> Result<()> {
        let path = self.path;
        self.lib
            .close()
            .with_context(|| format!("unloading {}", path.display()))?;
        debug!(path = %path.display(), "unloaded kernel module");
        Ok(())
    }
}

/// A resolved kernel symbol, valid while its module stays loaded.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint<'m> {
    func: KernelFn,
    _module: PhantomData<&'m NativeModule>,
}

impl EntryPoint<'_> {
    /// Run the kernel over `rows` rows of `buffer`.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of every element the kernel
    /// touches, for all `rows` rows.
    pub unsafe fn call(&self, buffer: *mut f32, rows: c_int) {
        (self.func)(buffer, rows)
    }

    fn raw(&self) -> KernelFn {
        self.func
    }
}

/// A kernel that has been compiled, loaded and resolved.
#[derive(Debug)]
pub struct CompiledKernel {
    entry: KernelFn,
    module: NativeModule,
    plan: MemoryPlan,
    output_offset: usize,
    required_arena: usize,
    fingerprint: u64,
}

impl CompiledKernel {
    /// The plan whose offsets the kernel was generated against.
    pub fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    pub fn output_offset(&self) -> usize {
        self.output_offset
    }

    pub fn required_arena(&self) -> usize {
        self.required_arena
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn module_path(&self) -> &Path {
        self.module.path()
    }

    pub(crate) fn entry(&self) -> KernelFn {
        self.entry
    }

    /// Unload the underlying module.
    pub fn release(self) -> Result<()> {
        self.module.unload()
    }
}

/// Paths of the artifacts a kernel build produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub source: PathBuf,
    pub module: PathBuf,
}

impl Artifacts {
    pub fn for_source(cfg: &JitConfig, source: &KernelSource) -> Self {
        let mut hasher = DefaultHasher::new();
        source.fingerprint().hash(&mut hasher);
        cfg.compiler.hash(&mut hasher);
        cfg.extra_flags.hash(&mut hasher);
        let key = hasher.finish();
        Self {
            source: cfg
                .cache_dir
                .join(format!("kernel_{:016x}.c", source.fingerprint())),
            module: cfg.cache_dir.join(format!(
                "libtinyjit_{key:016x}{}",
                toolchain::lib_ext()
            )),
        }
    }
}

/// Write, compile (unless cached), load and resolve `source`.
pub fn build(cfg: &JitConfig, source: &KernelSource) -> Result<CompiledKernel> {
    fs::create_dir_all(&cfg.cache_dir)
        .with_context(|| format!("creating kernel cache {}", cfg.cache_dir.display()))?;
    let artifacts = Artifacts::for_source(cfg, source);

    if artifacts.module.exists() {
        info!(module = %artifacts.module.display(), "reusing cached kernel module");
    } else {
        compile(cfg, source, &artifacts)?;
        info!(module = %artifacts.module.display(), "kernel module built");
    }

    let module = NativeModule::load(&artifacts.module)?;
    let entry = module.resolve(KERNEL_SYMBOL)?.raw();
    Ok(CompiledKernel {
        entry,
        module,
        plan: source.plan().clone(),
        output_offset: source.output_offset(),
        required_arena: source.required_arena(),
        fingerprint: source.fingerprint(),
    })
}

fn compile(cfg: &JitConfig, source: &KernelSource, artifacts: &Artifacts) -> Result<()> {
    let mut tmp_source = tempfile::Builder::new()
        .prefix("kernel_")
        .suffix(".c")
        .tempfile_in(&cfg.cache_dir)?;
    tmp_source.write_all(source.code().as_bytes())?;
    let tmp_source = tmp_source.into_temp_path();
    // Unique per build; dropped (and removed) unless the build succeeds.
    let tmp_module = tempfile::Builder::new()
        .prefix("libtinyjit_")
        .suffix(toolchain::lib_ext())
        .tempfile_in(&cfg.cache_dir)?
        .into_temp_path();

    let built = toolchain::compile_shared(cfg, &tmp_source, &tmp_module);
    // Keep the source next to the module, also when the build failed.
    tmp_source
        .persist(&artifacts.source)
        .map_err(|err| err.error)?;
    built?;
    tmp_module
        .persist(&artifacts.module)
        .map_err(|err| err.error)?;
    Ok(())
}
