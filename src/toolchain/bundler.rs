use std::{
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Bundler, CompilationUnit, SOURCE_EXTENSION, ToolchainError, compile, scan, script_engine};

static IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*import[ \t]+"([^"]+)"[ \t]+as[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*;[ \t]*\r?\n?"#)
        .expect("import pattern")
});
static EXPORT_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*export[ \t]+[A-Za-z_][A-Za-z0-9_]*(?:[ \t]+as[ \t]+[A-Za-z_][A-Za-z0-9_]*)?[ \t]*;[ \t]*\r?\n?",
    )
    .expect("export pattern")
});
static EXPORT_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([ \t]*)export[ \t]+(const|let)\b").expect("export declaration pattern"));

/// Inlines `import "<path>" as <alias>;` statements.
///
/// Imported files are placed ahead of the importing code, once each, with
/// their `export` statements removed. References through the alias
/// (`alias::name`) become plain references, so the result needs no module
/// resolver. Import paths resolve against the importing file's directory and
/// default to the `.rhai` extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct RhaiBundler;

#[async_trait]
impl Bundler for RhaiBundler {
    #[tracing::instrument(name = "bundle", skip_all, fields(unit = %unit.label))]
    async fn bundle(&self, unit: &CompilationUnit) -> Result<String, ToolchainError> {
        let mut included = HashSet::new();
        let mut modules = String::new();
        let body = inline(
            &unit.label,
            &unit.source,
            &unit.base_dir,
            &mut included,
            &mut modules,
        )?;

        let bundled = format!("{modules}{body}");
        compile(&script_engine(), &unit.label, &bundled)?;
        tracing::debug!(modules = included.len(), "bundled");
        Ok(bundled)
    }
}

fn inline(
    unit: &str,
    source: &str,
    base_dir: &Path,
    included: &mut HashSet<PathBuf>,
    modules: &mut String,
) -> Result<String, ToolchainError> {
    let imports: Vec<(String, String)> = IMPORT
        .captures_iter(source)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect();
    let mut aliases = Vec::with_capacity(imports.len());

    for (import, alias) in imports {
        aliases.push(alias);
        let path = resolve(base_dir, &import);
        if !included.insert(path.clone()) {
            continue;
        }

        let text = fs::read_to_string(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ToolchainError::ImportNotFound {
                unit: unit.to_string(),
                import: import.clone(),
                path: path.clone(),
            },
            _ => ToolchainError::Io {
                unit: unit.to_string(),
                path: path.clone(),
                source,
            },
        })?;
        let dir = path.parent().unwrap_or(base_dir).to_path_buf();
        let resolved = inline(unit, &text, &dir, included, modules)?;
        let stripped = EXPORT_STATEMENT.replace_all(&resolved, "");
        let stripped = EXPORT_DECLARATION.replace_all(&stripped, "$1$2");

        modules.push_str(stripped.trim());
        modules.push_str("\n\n");
    }

    let body = IMPORT.replace_all(source, "");
    unqualify(&body, &aliases)
}

fn resolve(base_dir: &Path, import: &str) -> PathBuf {
    let path = base_dir.join(import);
    if path.extension().is_some() {
        path
    } else {
        path.with_extension(SOURCE_EXTENSION)
    }
}

fn unqualify(source: &str, aliases: &[String]) -> Result<String, ToolchainError> {
    if aliases.is_empty() {
        return Ok(source.to_string());
    }
    let pattern = aliases
        .iter()
        .map(|alias| regex::escape(alias))
        .collect::<Vec<_>>()
        .join("|");
    // aliases are identifiers, so the pattern always compiles
    let qualifier = Regex::new(&format!(r"\b(?:{pattern})::")).map_err(|err| ToolchainError::Syntax {
        unit: "import aliases".into(),
        message: err.to_string(),
    })?;
    scan::map_code(source, |code| qualifier.replace_all(code, "").into_owned())
}
