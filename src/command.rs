//! Command builder
//!
//! Turns an entry-command template, an optional install template and the
//! user's source into the text written to the sandbox and the shell command
//! that runs it. Pure: identical inputs always give identical output, for
//! either backend.

use std::collections::BTreeSet;

/// Placeholder replaced with the source path in entry-command templates
pub const SOURCE_PLACEHOLDER: &str = "{file}";

/// Placeholder replaced with the dependency list in install templates
pub const DEPS_PLACEHOLDER: &str = "{deps}";

/// What to write and what to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    /// Full source file contents (setup code + user code)
    pub source: String,
    /// Final shell command
    pub command: String,
}

/// Build the source text and shell command for a run
pub fn build(
    entry_command: &str,
    dependencies: &[String],
    install_command: Option<&str>,
    setup_code: Option<&str>,
    source: &str,
    source_path: &str,
) -> CommandPlan {
    let source = match setup_code.filter(|s| !s.trim().is_empty()) {
        Some(setup) => format!("{}\n{}", setup, source),
        None => source.to_string(),
    };

    let quoted_path = shell_quote(source_path);
    let entry = if entry_command.contains(SOURCE_PLACEHOLDER) {
        entry_command.replacen(SOURCE_PLACEHOLDER, &quoted_path, 1)
    } else {
        format!("{} {}", entry_command.trim_end(), quoted_path)
    };

    let command = match install_command.filter(|c| !c.trim().is_empty()) {
        Some(install) if !dependencies.is_empty() => {
            format!("{} && {}", install_line(install, dependencies), entry)
        }
        _ => entry,
    };

    CommandPlan { source, command }
}

fn install_line(template: &str, dependencies: &[String]) -> String {
    let deps = dependencies
        .iter()
        .map(|d| shell_quote(d))
        .collect::<Vec<_>>()
        .join(" ");
    if template.contains(DEPS_PLACEHOLDER) {
        template.replacen(DEPS_PLACEHOLDER, &deps, 1)
    } else {
        format!("{} {}", template.trim_end(), deps)
    }
}

/// Quote a word for POSIX `sh`, leaving plain words untouched
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Name of the file the source is written to
pub fn source_file_name(extension: &str) -> String {
    let ext: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    match ext.as_str() {
        "" => "main".to_string(),
        // javac insists the file matches the public class
        "java" => "Main.java".to_string(),
        _ => format!("main.{}", ext),
    }
}

const PYTHON_STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "base64", "bisect", "builtins",
    "calendar", "cmath", "collections", "contextlib", "copy", "csv", "ctypes", "dataclasses",
    "datetime", "decimal", "difflib", "enum", "errno", "fractions", "functools", "gc", "glob",
    "hashlib", "heapq", "hmac", "html", "http", "importlib", "inspect", "io", "itertools", "json",
    "logging", "math", "multiprocessing", "operator", "os", "pathlib", "pickle", "platform",
    "pprint", "queue", "random", "re", "secrets", "shutil", "signal", "socket", "sqlite3",
    "statistics", "string", "struct", "subprocess", "sys", "tempfile", "textwrap", "threading",
    "time", "timeit", "traceback", "types", "typing", "unicodedata", "unittest", "urllib", "uuid",
    "warnings", "weakref", "xml", "zipfile", "zlib",
];

/// Import names whose package is published under another name
const PYTHON_RENAMES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
];

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "cluster", "crypto", "dgram", "dns", "events", "fs",
    "http", "http2", "https", "net", "os", "path", "perf_hooks", "process", "querystring",
    "readline", "stream", "string_decoder", "timers", "tls", "tty", "url", "util", "v8", "vm",
    "worker_threads", "zlib",
];

/// Detect third-party dependencies imported by `source`.
///
/// Sorted and de-duplicated so the resulting install command is stable.
pub fn detect_dependencies(extension: &str, source: &str) -> Vec<String> {
    let found: BTreeSet<String> = match extension.trim_start_matches('.') {
        "py" => source.lines().flat_map(python_imports).collect(),
        "js" | "mjs" | "cjs" | "ts" | "jsx" | "tsx" => {
            source.lines().flat_map(javascript_imports).collect()
        }
        _ => BTreeSet::new(),
    };
    found.into_iter().collect()
}

fn python_imports(line: &str) -> Vec<String> {
    let line = line.trim();
    let modules: Vec<&str> = if let Some(rest) = line.strip_prefix("import ") {
        rest.split(',')
            .filter_map(|part| part.split_whitespace().next())
            .collect()
    } else if let Some(rest) = line.strip_prefix("from ") {
        match rest.split_whitespace().next() {
            Some(module) if rest.contains(" import ") => vec![module],
            _ => Vec::new(),
        }
    } else {
        Vec::new()
    };

    modules
        .into_iter()
        .filter(|m| !m.starts_with('.'))
        .filter_map(|m| m.split('.').next())
        .filter(|root| !root.is_empty() && !PYTHON_STDLIB.contains(root))
        .map(|root| {
            PYTHON_RENAMES
                .iter()
                .find(|(import, _)| *import == root)
                .map(|(_, package)| package.to_string())
                .unwrap_or_else(|| root.to_string())
        })
        .collect()
}

fn javascript_imports(line: &str) -> Vec<String> {
    let line = line.trim();
    let mut specifiers = Vec::new();

    let mut rest = line;
    while let Some(idx) = rest.find("require(") {
        rest = &rest[idx + "require(".len()..];
        if let Some(spec) = quoted_literal(rest) {
            specifiers.push(spec);
        }
    }
    if line.starts_with("import ") || line.starts_with("export ") {
        if let Some(idx) = line.rfind(" from ") {
            specifiers.extend(quoted_literal(&line[idx + " from ".len()..]));
        } else if let Some(rest) = line.strip_prefix("import ") {
            specifiers.extend(quoted_literal(rest));
        }
    }

    specifiers
        .into_iter()
        .filter_map(package_name)
        .collect()
}

fn quoted_literal(text: &str) -> Option<&str> {
    let text = text.trim_start();
    let quote = text.chars().next().filter(|c| matches!(c, '\'' | '"' | '`'))?;
    let body = &text[quote.len_utf8()..];
    body.find(quote).map(|end| &body[..end])
}

fn package_name(specifier: &str) -> Option<String> {
    if specifier.is_empty()
        || specifier.starts_with('.')
        || specifier.starts_with('/')
        || specifier.starts_with("node:")
    {
        return None;
    }
    let mut parts = specifier.split('/');
    let name = if specifier.starts_with('@') {
        let scope = parts.next()?;
        let pkg = parts.next()?;
        format!("{}/{}", scope, pkg)
    } else {
        parts.next()?.to_string()
    };
    if NODE_BUILTINS.contains(&name.as_str()) {
        None
    } else {
        Some(name)
    }
}
