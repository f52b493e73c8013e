//! Selection of kernel functions to kprobe, driven by BTF.
//!
//! A function is selected when its name fully matches the configured pattern
//! and one of its first five parameters is a pointer to the configured
//! structure. The 1-based position of that parameter tells the kprobe program
//! which register to read the structure pointer from, which is why positions
//! past the fifth argument register are never produced.
//!
//! BTF parsing is kept behind [`FunctionSource`] so that the matching rules in
//! [`select_functions`] operate on plain signatures.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use btf_rs::{Btf, Type};
use regex::Regex;
use thiserror::Error;

/// Highest argument position a kprobe program can read.
pub const MAX_ARG_POSITION: u8 = 5;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("invalid function pattern {pattern:?}: {source}")]
    Compile {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to load BTF from {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("invalid function spec {0:?}, expected name:position with position in 1..=5")]
    InvalidFuncSpec(String),
}

/// A kernel function to attach to, and where its structure argument lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub function: String,
    pub arg_position: u8,
    pub module: Option<String>,
}

impl ProbeTarget {
    /// Name used to keep same-named functions from different modules apart.
    pub fn key(&self) -> String {
        match &self.module {
            Some(module) => format!("{} [{}]", self.function, module),
            None => self.function.clone(),
        }
    }
}

/// Selected targets keyed by [`ProbeTarget::key`].
pub type SelectedFuncs = BTreeMap<String, ProbeTarget>;

/// A function prototype reduced to what matching needs: for every parameter,
/// the name of the structure it points to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSignature {
    pub name: String,
    pub params: Vec<Option<String>>,
}

/// Provider of candidate function signatures, one group per type source.
pub trait FunctionSource {
    /// Signatures from the kernel image whose names match `pattern`.
    fn kernel_functions(&self, pattern: &Regex) -> Result<Vec<FuncSignature>, SelectError>;

    /// Signatures defined by `module` whose names match `pattern`.
    fn module_functions(
        &self,
        module: &str,
        pattern: &Regex,
    ) -> Result<Vec<FuncSignature>, SelectError>;
}

/// Compile `pattern` so that it only matches whole function names.
pub fn compile_pattern(pattern: &str) -> Result<Regex, SelectError> {
    let anchored = if pattern.is_empty() {
        ".*".to_string()
    } else {
        format!("^(?:{pattern})$")
    };
    Regex::new(&anchored).map_err(|source| SelectError::Compile {
        pattern: pattern.to_string(),
        source,
    })
}

/// 1-based position of the first parameter pointing at `filter_struct`.
pub fn match_position(sig: &FuncSignature, filter_struct: &str) -> Option<u8> {
    sig.params
        .iter()
        .take(MAX_ARG_POSITION as usize)
        .position(|param| param.as_deref() == Some(filter_struct))
        .map(|idx| idx as u8 + 1)
}

/// Run selection over the kernel and each module in `modules`.
pub fn select_functions(
    source: &dyn FunctionSource,
    pattern: &str,
    filter_struct: &str,
    modules: &[String],
) -> Result<SelectedFuncs, SelectError> {
    let regex = compile_pattern(pattern)?;
    let mut selected = SelectedFuncs::new();

    let mut groups = vec![(None, source.kernel_functions(&regex)?)];
    for module in modules {
        groups.push((
            Some(module.clone()),
            source.module_functions(module, &regex)?,
        ));
    }

    for (module, signatures) in groups {
        for sig in signatures {
            if !regex.is_match(&sig.name) {
                continue;
            }
            let Some(arg_position) = match_position(&sig, filter_struct) else {
                continue;
            };
            let target = ProbeTarget {
                function: sig.name,
                arg_position,
                module: module.clone(),
            };
            selected.entry(target.key()).or_insert(target);
        }
    }

    Ok(selected)
}

/// Parse an operator supplied `name:position[,name:position...]` list.
pub fn parse_func_list(spec: &str) -> Result<Vec<ProbeTarget>, SelectError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, pos) = entry
                .rsplit_once(':')
                .ok_or_else(|| SelectError::InvalidFuncSpec(entry.to_string()))?;
            let arg_position = pos
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| (1..=MAX_ARG_POSITION).contains(p))
                .ok_or_else(|| SelectError::InvalidFuncSpec(entry.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(SelectError::InvalidFuncSpec(entry.to_string()));
            }
            Ok(ProbeTarget {
                function: name.to_string(),
                arg_position,
                module: None,
            })
        })
        .collect()
}

/// Union operator entries into `selected`; operator entries win on collision.
pub fn merge_funcs(selected: &mut SelectedFuncs, extra: Vec<ProbeTarget>) {
    for target in extra {
        selected.insert(target.key(), target);
    }
}

/// Names of every module that ships split BTF in `dir`.
pub fn list_modules(dir: &Path) -> Result<Vec<String>, SelectError> {
    let entries = fs::read_dir(dir).map_err(|e| SelectError::Load {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut modules: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name != "vmlinux")
        .collect();
    modules.sort();
    Ok(modules)
}

/// [`FunctionSource`] backed by the kernel's BTF files.
pub struct BtfSource {
    base: Btf,
    module_dir: PathBuf,
}

impl BtfSource {
    pub fn new(kernel_btf: &Path, module_dir: &Path) -> Result<Self, SelectError> {
        let base = Btf::from_file(kernel_btf).map_err(|e| SelectError::Load {
            path: kernel_btf.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            base,
            module_dir: module_dir.to_path_buf(),
        })
    }

    fn signatures(btf: &Btf, pattern: &Regex) -> Vec<FuncSignature> {
        let Ok(types) = btf.resolve_types_by_regex(pattern) else {
            return Vec::new();
        };
        types
            .into_iter()
            .filter_map(|ty| match ty {
                Type::Func(func) => {
                    let name = btf.resolve_name(&func).ok()?;
                    let Type::FuncProto(proto) = btf.resolve_chained_type(&func).ok()? else {
                        return None;
                    };
                    let params = proto
                        .parameters
                        .iter()
                        .map(|param| pointee_struct(btf, param))
                        .collect();
                    Some(FuncSignature { name, params })
                }
                _ => None,
            })
            .collect()
    }
}

/// Name of the structure a parameter points to, looking through qualifiers.
fn pointee_struct(btf: &Btf, param: &btf_rs::Parameter) -> Option<String> {
    let Type::Ptr(ptr) = btf.resolve_chained_type(param).ok()? else {
        return None;
    };
    let mut target = btf.resolve_chained_type(&ptr).ok()?;
    loop {
        target = match target {
            Type::Struct(st) => return btf.resolve_name(&st).ok(),
            Type::Const(t) => btf.resolve_chained_type(&t).ok()?,
            Type::Volatile(t) => btf.resolve_chained_type(&t).ok()?,
            Type::Restrict(t) => btf.resolve_chained_type(&t).ok()?,
            Type::TypeTag(t) => btf.resolve_chained_type(&t).ok()?,
            _ => return None,
        };
    }
}

impl FunctionSource for BtfSource {
    fn kernel_functions(&self, pattern: &Regex) -> Result<Vec<FuncSignature>, SelectError> {
        Ok(Self::signatures(&self.base, pattern))
    }

    fn module_functions(
        &self,
        module: &str,
        pattern: &Regex,
    ) -> Result<Vec<FuncSignature>, SelectError> {
        let path = self.module_dir.join(module);
        let split = Btf::from_split_file(&path, &self.base).map_err(|e| SelectError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        // Split BTF resolves base types too; keep only what the module adds.
        let base_names: HashSet<String> = Self::signatures(&self.base, pattern)
            .into_iter()
            .map(|sig| sig.name)
            .collect();
        Ok(Self::signatures(&split, pattern)
            .into_iter()
            .filter(|sig| !base_names.contains(&sig.name))
            .collect())
    }
}
