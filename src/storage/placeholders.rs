// 命名占位符改写：`:name` -> `?N` / `$N`，跳过字符串字面量、注释、`::` 类型转换，
// 以及 SQLite 的 `[标识符]` 与 Postgres 的 `$tag$ ... $tag$` 美元引用。

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    QuestionNumbered,
    DollarNumbered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenSql {
    pub text: String,
    /// 第 i 个位置参数对应的名字（位置从 1 开始）。
    pub names: Vec<String>,
}

#[derive(Clone, Copy)]
enum Scan {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
    /// 美元引用体，记录起始标签在输入中的位置与长度。
    DollarQuoted { tag_start: usize, tag_len: usize },
}

/// `index` 处若是 `$tag$` 或 `$$` 形式的美元引用起始标签，返回标签长度（含两端 `$`）。
/// `$1` 这类位置参数不算标签。
fn dollar_tag_len(chars: &[char], index: usize) -> Option<usize> {
    let mut end = index + 1;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    if chars.get(end) != Some(&'$') {
        return None;
    }
    if chars.get(index + 1).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(end - index + 1)
}

pub fn rewrite_named(sql: &str, style: PlaceholderStyle) -> RewrittenSql {
    let chars: Vec<char> = sql.chars().collect();
    let mut text = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut state = Scan::Code;
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        let next = chars.get(index + 1).copied();
        match state {
            Scan::Quoted(quote) => {
                text.push(ch);
                if ch == quote {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                text.push(ch);
                if ch == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                text.push(ch);
                if ch == '*' && next == Some('/') {
                    text.push('/');
                    index += 1;
                    state = Scan::Code;
                }
            }
            Scan::DollarQuoted { tag_start, tag_len } => {
                let closes = ch == '$'
                    && index + tag_len <= chars.len()
                    && chars[index..index + tag_len] == chars[tag_start..tag_start + tag_len];
                if closes {
                    text.extend(&chars[index..index + tag_len]);
                    index += tag_len;
                    state = Scan::Code;
                    continue;
                }
                text.push(ch);
            }
            Scan::Code => match ch {
                '\'' | '"' | '`' => {
                    text.push(ch);
                    state = Scan::Quoted(ch);
                }
                '[' if style == PlaceholderStyle::QuestionNumbered => {
                    text.push(ch);
                    state = Scan::Quoted(']');
                }
                '$' if style == PlaceholderStyle::DollarNumbered => match dollar_tag_len(&chars, index) {
                    Some(tag_len) => {
                        text.extend(&chars[index..index + tag_len]);
                        state = Scan::DollarQuoted {
                            tag_start: index,
                            tag_len,
                        };
                        index += tag_len;
                        continue;
                    }
                    None => text.push(ch),
                },
                '-' if next == Some('-') => {
                    text.push_str("--");
                    index += 1;
                    state = Scan::LineComment;
                }
                '/' if next == Some('*') => {
                    text.push_str("/*");
                    index += 1;
                    state = Scan::BlockComment;
                }
                ':' if next == Some(':') => {
                    text.push_str("::");
                    index += 1;
                }
                ':' if next.is_some_and(|c| c.is_ascii_alphabetic() || c == '_') => {
                    let start = index + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    let position = match names.iter().position(|known| *known == name) {
                        Some(existing) => existing + 1,
                        None => {
                            names.push(name);
                            names.len()
                        }
                    };
                    match style {
                        PlaceholderStyle::QuestionNumbered => text.push('?'),
                        PlaceholderStyle::DollarNumbered => text.push('$'),
                    }
                    text.push_str(&position.to_string());
                    index = end;
                    continue;
                }
                _ => text.push(ch),
            },
        }
        index += 1;
    }
    RewrittenSql { text, names }
}
