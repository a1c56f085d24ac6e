use super::*;
use crate::generation::JobEvent;
use proptest::prelude::*;

fn arb_job_id() -> impl Strategy<Value = String> {
    "[a-f0-9]{8}-[a-f0-9]{4}"
}

proptest! {
    /// Tokens printed on stream events parse back to the same card index
    #[test]
    fn prop_resume_token_points_at_last_card(job_id in arb_job_id(), index in 0usize..10_000) {
        let token = JobEvent::resume_token(&job_id, Some(index));
        prop_assert_eq!(parse_resume_token(&token, &job_id), Some(index));

        let start = JobEvent::resume_token(&job_id, None);
        prop_assert_eq!(parse_resume_token(&start, &job_id), None);
    }

    /// A token never resumes a different job
    #[test]
    fn prop_resume_token_is_job_scoped(a in arb_job_id(), b in arb_job_id(), index in 0usize..100) {
        prop_assume!(a != b);
        let token = JobEvent::resume_token(&a, Some(index));
        prop_assert_eq!(parse_resume_token(&token, &b), None);
    }

    #[test]
    fn prop_threshold_bounds(threshold in -2.0f64..3.0) {
        let accepted = check_threshold(threshold).is_ok();
        prop_assert_eq!(accepted, (0.0..=1.0).contains(&threshold));
    }

    /// Any body naming an Anki note is treated as a sync report
    #[test]
    fn prop_patch_with_note_id_is_sync_report(note_id in 1i64..i64::MAX, tags in prop::collection::vec("[a-z]{1,8}", 0..3)) {
        let body = serde_json::json!({ "status": "synced", "anki_note_id": note_id, "tags": tags });
        let patch = CardPatch::from_value(body).unwrap();
        prop_assert!(matches!(patch, CardPatch::SyncReport(ref r) if r.anki_note_id == Some(note_id)));
    }

    /// Repeated `tags` keys keep their order
    #[test]
    fn prop_card_query_tags(tags in prop::collection::vec("[a-z0-9]{1,12}", 0..6)) {
        let query_string = tags.iter().map(|t| format!("tags={t}")).collect::<Vec<_>>().join("&");
        let query: CardListQuery = serde_html_form::from_str(&query_string).unwrap();
        prop_assert_eq!(query.tags, tags);
    }
}
