//! Environment preamble for Python execution.
//!
//! The model writing the code cannot be expected to know which fonts exist
//! on the host or that the default C locale breaks wide-character output, so
//! the executor fixes both silently before the user source runs. The
//! preamble is textual and is inserted *after* the leading import block so
//! the semantic evaluation order of user imports is unchanged.

use super::changeset::FILE_SENTINEL;

/// Build the preamble for one execution.
pub fn build_preamble(conversation_id: &str) -> String {
    format!(
        r#"# -- runtime environment setup --
import os as _os
import sys as _sys
import locale as _locale
try:
    _locale.setlocale(_locale.LC_ALL, "")
except _locale.Error:
    pass
CONVERSATION_ID = {conv_id:?}
DEFAULT_CONFIG = {{"conversation_id": CONVERSATION_ID, "output_dir": "."}}
_os.environ.setdefault("CONVERSATION_ID", CONVERSATION_ID)
_CJK_FONTS = {{
    "linux": [
        "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
        "/usr/share/fonts/noto-cjk/NotoSansCJK-Regular.ttc",
        "/usr/share/fonts/truetype/wqy/wqy-zenhei.ttc",
        "/usr/share/fonts/wenquanyi/wqy-zenhei/wqy-zenhei.ttc",
    ],
    "darwin": [
        "/System/Library/Fonts/PingFang.ttc",
        "/System/Library/Fonts/Hiragino Sans GB.ttc",
        "/System/Library/Fonts/STHeiti Light.ttc",
    ],
    "win32": [
        "C:\\Windows\\Fonts\\msyh.ttc",
        "C:\\Windows\\Fonts\\msyh.ttf",
        "C:\\Windows\\Fonts\\simhei.ttf",
    ],
}}
def _first_existing(paths):
    for _p in paths:
        if _os.path.exists(_p):
            return _p
    return None
try:
    import matplotlib as _mpl
    _font = _first_existing(_CJK_FONTS.get(_sys.platform, []))
    if _font:
        from matplotlib import font_manager as _fm
        _fm.fontManager.addfont(_font)
        _mpl.rcParams["font.family"] = _fm.FontProperties(fname=_font).get_name()
        _mpl.rcParams["axes.unicode_minus"] = False
except Exception:
    pass
def register_output(path):
    print({sentinel:?} + str(path), flush=True)
# -- end runtime environment setup --
"#,
        conv_id = conversation_id,
        sentinel = FILE_SENTINEL,
    )
}

/// Insert `preamble` into `source` after the leading import block (shebang,
/// encoding comments, blank lines, comments, and `import`/`from` statements,
/// including parenthesized import lists).
pub fn inject(source: &str, preamble: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut insert_at = 0;
    let mut open_parens = 0usize;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if open_parens > 0 {
            open_parens = open_parens
                .saturating_add(trimmed.matches('(').count())
                .saturating_sub(trimmed.matches(')').count());
            insert_at = i + 1;
            continue;
        }
        let is_import = trimmed.starts_with("import ") || trimmed.starts_with("from ");
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if is_import {
            open_parens = trimmed
                .matches('(')
                .count()
                .saturating_sub(trimmed.matches(')').count());
            insert_at = i + 1;
            continue;
        }
        break;
    }

    let mut out = String::with_capacity(source.len() + preamble.len() + 2);
    for line in &lines[..insert_at] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(preamble);
    if !preamble.ends_with('\n') {
        out.push('\n');
    }
    for line in &lines[insert_at..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}
