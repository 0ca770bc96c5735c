use std::fmt;

const PAGED_PREFIX: &str = "fileId@";
const PAGE_MARKER: &str = "$page@";
const MAX_PAGE_MARKER: &str = "$maxPage@";
const BLOB_PREFIX: &str = "blobName@";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentKey {
    Paged { id: String, page: u32, total: u32 },
    Blob { name: String },
    Literal(String),
}

impl DocumentKey {
    pub fn paged(id: impl Into<String>, page: u32, total: u32) -> Self {
        DocumentKey::Paged {
            id: id.into(),
            page,
            total,
        }
    }

    pub fn single(id: impl Into<String>) -> Self {
        Self::paged(id, 1, 1)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        DocumentKey::Blob { name: name.into() }
    }

    /// Never fails: strings that do not match a structured shape become `Literal`.
    pub fn parse(display_name: &str) -> Self {
        if let Some(key) = parse_paged(display_name) {
            return key;
        }
        if let Some(name) = display_name.strip_prefix(BLOB_PREFIX) {
            return DocumentKey::blob(name);
        }
        DocumentKey::Literal(display_name.to_string())
    }

    pub fn document_name(&self) -> &str {
        match self {
            DocumentKey::Paged { id, .. } => id,
            DocumentKey::Blob { name } => name,
            DocumentKey::Literal(name) => name,
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            DocumentKey::Paged { page, .. } => Some(*page),
            _ => None,
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, DocumentKey::Paged { .. })
    }

    pub fn display_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKey::Paged { id, page, total } => {
                write!(f, "{PAGED_PREFIX}{id}{PAGE_MARKER}{page}{MAX_PAGE_MARKER}{total}")
            }
            DocumentKey::Blob { name } => write!(f, "{BLOB_PREFIX}{name}"),
            DocumentKey::Literal(name) => f.write_str(name),
        }
    }
}

fn parse_paged(display_name: &str) -> Option<DocumentKey> {
    let rest = display_name.strip_prefix(PAGED_PREFIX)?;
    let (rest, total) = rest.rsplit_once(MAX_PAGE_MARKER)?;
    let (id, page) = rest.rsplit_once(PAGE_MARKER)?;
    let page: u32 = page.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    if page == 0 || page > total {
        return None;
    }
    Some(DocumentKey::paged(id, page, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_shapes() {
        assert_eq!(
            DocumentKey::parse("fileId@1AbC$page@3$maxPage@7"),
            DocumentKey::paged("1AbC", 3, 7)
        );
        assert_eq!(
            DocumentKey::parse("blobName@scan.png"),
            DocumentKey::blob("scan.png")
        );
        assert_eq!(
            DocumentKey::parse("report.pdf"),
            DocumentKey::Literal("report.pdf".into())
        );
    }

    #[test]
    fn encodes_back_to_the_wire_form() {
        for raw in [
            "fileId@doc$page@2$maxPage@4",
            "blobName@a b.jpg",
            "plain name",
        ] {
            assert_eq!(DocumentKey::parse(raw).display_name(), raw);
        }
    }

    #[test]
    fn malformed_paged_names_fall_back_to_literal() {
        for raw in [
            "fileId@doc$page@x$maxPage@4",
            "fileId@doc$page@0$maxPage@4",
            "fileId@doc$page@5$maxPage@4",
            "fileId@doc$maxPage@4",
        ] {
            assert_eq!(DocumentKey::parse(raw), DocumentKey::Literal(raw.into()));
        }
    }

    #[test]
    fn document_name_ignores_page_fields() {
        let key = DocumentKey::parse("fileId@https://x/y?a=b$page@1$maxPage@1");
        assert_eq!(key.document_name(), "https://x/y?a=b");
        assert_eq!(key.page(), Some(1));
    }
}
