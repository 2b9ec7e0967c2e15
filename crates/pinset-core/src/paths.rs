//! Checkout-relative path arithmetic. Paths use `/` and never start with one.

/// Normalize `path`: drop empty and `.` segments, apply `..`.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

pub fn join(base: &str, rel: &str) -> String {
    clean(&format!("{base}/{rel}"))
}

pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(p, _)| p)
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, f)| f)
}

/// The part of `path` below `ancestor`, if `ancestor` covers `path`.
pub fn strip_ancestor<'a>(path: &'a str, ancestor: &str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    if path == ancestor {
        return Some("");
    }
    path.strip_prefix(ancestor)?.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_normalizes() {
        assert_eq!(clean("./a//b/./c/"), "a/b/c");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("../a"), "a");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn join_and_split() {
        assert_eq!(join("src", "third_party/x"), "src/third_party/x");
        assert_eq!(join("", "src"), "src");
        assert_eq!(join("src/build", "../tools"), "src/tools");
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
        assert_eq!(file_name("a/b/c.py"), "c.py");
        assert_eq!(file_name("c.py"), "c.py");
    }

    #[test]
    fn ancestors() {
        assert_eq!(strip_ancestor("a/b/c.txt", "a/b"), Some("c.txt"));
        assert_eq!(strip_ancestor("a/b", "a/b"), Some(""));
        assert_eq!(strip_ancestor("a/bc", "a/b"), None);
        assert_eq!(strip_ancestor("a/b", ""), Some("a/b"));
    }
}
