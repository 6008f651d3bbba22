//! Test metadata carried as free-form tags, e.g. `maintainer: alice` or
//! `labels: area: checkout, priority: high`.

use zbr_api::Label;

use crate::tcm::{TestRailKey, XrayKey, ZephyrKey};

const MAINTAINER_TAG: &str = "maintainer";
const LABELS_TAG: &str = "labels";
const TEST_RAIL_CASE_TAG: &str = "test_rail_case_id";
const XRAY_TEST_TAG: &str = "xray_test_key";
const ZEPHYR_TEST_CASE_TAG: &str = "zephyr_test_case_key";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestMetadata {
    pub maintainer: Option<String>,
    pub labels: Vec<Label>,
}

pub fn parse_test_tags<S: AsRef<str>>(tags: &[S]) -> TestMetadata {
    let mut metadata = TestMetadata::default();
    for tag in tags {
        let Some((name, value)) = tag.as_ref().split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match name.trim().to_ascii_lowercase().as_str() {
            MAINTAINER_TAG => metadata.maintainer = Some(value.to_string()),
            LABELS_TAG => metadata.labels.extend(parse_label_pairs(value)),
            TEST_RAIL_CASE_TAG => {
                metadata
                    .labels
                    .extend(split_values(value).map(|id| Label::new(TestRailKey::CaseId.label_key(), id)));
            }
            XRAY_TEST_TAG => {
                metadata
                    .labels
                    .extend(split_values(value).map(|key| Label::new(XrayKey::TestKey.label_key(), key)));
            }
            ZEPHYR_TEST_CASE_TAG => {
                metadata.labels.extend(
                    split_values(value).map(|key| Label::new(ZephyrKey::TestCaseKey.label_key(), key)),
                );
            }
            _ => {}
        }
    }
    metadata
}

fn split_values(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_label_pairs(raw: &str) -> impl Iterator<Item = Label> + '_ {
    split_values(raw).filter_map(|pair| {
        let (key, value) = pair.split_once(':')?;
        let (key, value) = (key.trim(), value.trim());
        (!key.is_empty() && !value.is_empty()).then(|| Label::new(key, value))
    })
}
