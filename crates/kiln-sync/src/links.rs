//! Post links.
//!
//! Campaign submissions carry post URLs such as
//! `https://x.com/someone/status/1790000000000000000?s=20`. The metrics API
//! wants the numeric id.

use kiln_types::{SubjectId, SyncJob};

/// Extract the numeric post id from a `.../status/{id}` link.
pub fn post_id_from_link(link: &str) -> Option<String> {
    let (_, rest) = link.split_once("status/")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Build a sync job from post links, skipping links without an id.
pub fn job_from_links<'a>(
    subject: &SubjectId,
    links: impl IntoIterator<Item = &'a str>,
) -> SyncJob {
    SyncJob {
        subject_id: subject.clone(),
        requested_ids: links.into_iter().filter_map(post_id_from_link).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ids() {
        assert_eq!(
            post_id_from_link("https://x.com/kol/status/1790000000000000001?s=20").as_deref(),
            Some("1790000000000000001")
        );
        assert_eq!(
            post_id_from_link("https://twitter.com/i/web/status/42").as_deref(),
            Some("42")
        );
        assert_eq!(post_id_from_link("https://x.com/kol"), None);
        assert_eq!(post_id_from_link("https://x.com/kol/status/abc"), None);
    }

    #[test]
    fn job_skips_unparseable_links() {
        let job = job_from_links(
            &SubjectId::from("c1"),
            ["https://x.com/a/status/1", "not a link", "https://x.com/b/status/2/photo/1"],
        );
        assert_eq!(job.requested_ids, vec!["1".to_owned(), "2".to_owned()]);
    }
}
