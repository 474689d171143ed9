use std::{collections::BTreeSet, sync::LazyLock};

use phf::phf_map;
use regex::Regex;
use tree_sitter::Parser;

/// Import (or alias) name to pip distribution. Some distributions are not
/// named after their import.
static IMPORT_TO_DISTRIBUTION: phf::Map<&'static str, &'static str> = phf_map! {
    "pd" => "pandas",
    "pandas" => "pandas",
    "np" => "numpy",
    "numpy" => "numpy",
    "plt" => "matplotlib",
    "matplotlib" => "matplotlib",
    "sklearn" => "scikit-learn",
    "tensorflow" => "tensorflow",
    "torch" => "torch",
    "cv2" => "opencv-python",
    "requests" => "requests",
    "bs4" => "beautifulsoup4",
    "seaborn" => "seaborn",
};

// Catches `pd.DataFrame(..)`-style namespace references whose import got
// aliased away or omitted from the snippet.
static NAMESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    let names =
        IMPORT_TO_DISTRIBUTION.keys().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
    Regex::new(&format!(r"\b({names})\.")).expect("PROOF: escaped alternation")
});

const INSTALL_HELPER: &str = r#"
import sys
import subprocess
from importlib import metadata

def install_package(package):
    try:
        metadata.version(package)
        return
    except metadata.PackageNotFoundError:
        pass

    process = subprocess.run(
        [sys.executable, '-m', 'pip', 'install', '--user', '--no-input', package],
        capture_output=True,
        text=True,
    )
    if process.returncode != 0:
        raise RuntimeError(
            (process.stderr or process.stdout or f"pip install failed: {package}").strip()
        )

"#;

// WenQuanYi ships with the sandbox image; the default font renders CJK
// labels as boxes.
const MATPLOTLIB_SETUP: &str = r#"
import matplotlib.pyplot as plt
import matplotlib as mpl

plt.rcParams['font.sans-serif'] = ['WenQuanYi Micro Hei']
plt.rcParams['axes.unicode_minus'] = False
"#;

const CHART_EPILOGUE: &str = r#"

if 'plt' in globals() and plt.get_fignums():
    plt.savefig('/code/output/result.png', dpi=300, bbox_inches='tight')
    plt.close('all')
"#;

#[must_use]
pub(crate) fn uses_matplotlib(snippet: &str) -> bool {
    snippet.contains("plt") || snippet.contains("matplotlib")
}

/// The pip distributions a snippet needs: parsed imports unioned with the
/// namespace-prefix scan, both mapped through the distribution table.
#[must_use]
pub(crate) fn required_distributions(snippet: &str) -> BTreeSet<&'static str> {
    let mut dists = BTreeSet::new();
    for root in parsed_import_roots(snippet) {
        if let Some(dist) = IMPORT_TO_DISTRIBUTION.get(root.as_str()) {
            dists.insert(*dist);
        }
    }
    for caps in NAMESPACE_RE.captures_iter(snippet) {
        if let Some(name) = caps.get(1) {
            if let Some(dist) = IMPORT_TO_DISTRIBUTION.get(name.as_str()) {
                dists.insert(*dist);
            }
        }
    }
    dists
}

/// Top-level module names referenced by `import` / `from .. import`
/// statements. Tree-sitter recovers around syntax errors, so a broken
/// snippet still yields its parseable imports.
#[must_use]
fn parsed_import_roots(snippet: &str) -> BTreeSet<String> {
    let mut roots = BTreeSet::new();
    let mut parser = Parser::new();
    if parser.set_language(&tree_sitter_python::LANGUAGE.into()).is_err() {
        return roots;
    }
    let Some(tree) = parser.parse(snippet, None) else { return roots };

    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    let target = if child.kind() == "aliased_import" {
                        child.named_child(0)
                    } else {
                        Some(child)
                    };
                    if let Some(name) = target.and_then(|n| n.utf8_text(snippet.as_bytes()).ok())
                    {
                        insert_root(&mut roots, name);
                    }
                }
            }
            "import_from_statement" => {
                if let Some(name) =
                    node.named_child(0).and_then(|n| n.utf8_text(snippet.as_bytes()).ok())
                {
                    insert_root(&mut roots, name);
                }
            }
            _ => {
                let mut cursor = node.walk();
                stack.extend(node.named_children(&mut cursor));
            }
        }
    }
    roots
}

fn insert_root(roots: &mut BTreeSet<String>, dotted: &str) {
    // Relative imports (`from . import x`) have an empty root: not installable.
    if let Some(root) = dotted.split('.').next() {
        if !root.is_empty() {
            roots.insert(root.to_owned());
        }
    }
}

/// Final guest script: dependency installer, charting setup when the snippet
/// charts, the snippet itself (interactive display calls stripped), then the
/// chart-save epilogue.
#[must_use]
pub(crate) fn assemble(snippet: &str) -> String {
    let charting = uses_matplotlib(snippet);
    let code = snippet.replace("plt.show()", "");

    let mut setup = String::new();
    let dists = required_distributions(snippet);
    if !dists.is_empty() {
        setup.push_str(INSTALL_HELPER);
        for dist in &dists {
            setup.push_str(&format!("install_package('{dist}')\n"));
        }
    }
    if charting {
        setup.push_str(MATPLOTLIB_SETUP);
    }

    let mut full = format!("{setup}\n{code}");
    if charting {
        full.push_str(CHART_EPILOGUE);
    }
    full
}
