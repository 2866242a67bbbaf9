//! CSV renderings of FAQ entries: the failed-entry report written after an
//! import and the full export of a base.

use std::{borrow::Cow, collections::HashMap};

use common::storage::types::{
    chunk::Chunk,
    faq::{AnswerStrategy, FaqFailedEntry},
};

/// Excel needs the BOM to read the report as UTF-8.
const UTF8_BOM: &str = "\u{feff}";
const LIST_SEPARATOR: &str = "##";

pub const FAILED_ENTRIES_HEADER: &str = "错误原因,分类(必填),问题(必填),相似问题(选填-多个用##分隔),反例问题(选填-多个用##分隔),机器人回答(必填-多个用##分隔),是否全部回复(选填-默认FALSE),是否停用(选填-默认FALSE)";

pub const EXPORT_HEADER: &str = "分类(必填),问题(必填),相似问题(选填-多个用##分隔),反例问题(选填-多个用##分隔),机器人回答(必填-多个用##分隔),是否全部回复(选填-默认FALSE),是否停用(选填-默认FALSE),是否禁止被推荐(选填-默认False 可被推荐)";

pub(crate) fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn push_row(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&csv_field(field));
    }
    out.push('\n');
}

fn upper_bool(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

fn lower_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

pub(crate) fn failed_entries_csv(entries: &[FaqFailedEntry]) -> String {
    let mut out = String::from(UTF8_BOM);
    out.push_str(FAILED_ENTRIES_HEADER);
    out.push('\n');
    for entry in entries {
        push_row(
            &mut out,
            &[
                &entry.reason,
                &entry.tag_name,
                &entry.standard_question,
                &entry.similar_questions.join(LIST_SEPARATOR),
                &entry.negative_questions.join(LIST_SEPARATOR),
                &entry.answers.join(LIST_SEPARATOR),
                lower_bool(entry.answer_all),
                lower_bool(entry.is_disabled),
            ],
        );
    }
    out
}

/// Renders FAQ chunks, resolving tag ids through `tag_names`. Chunks without
/// FAQ metadata are skipped.
pub(crate) fn export_csv(chunks: &[Chunk], tag_names: &HashMap<String, String>) -> String {
    let mut out = String::from(EXPORT_HEADER);
    out.push('\n');
    for chunk in chunks {
        let Some(meta) = chunk.faq_metadata() else {
            continue;
        };
        let tag_name = tag_names.get(&chunk.tag_id).map_or("", String::as_str);
        push_row(
            &mut out,
            &[
                tag_name,
                &meta.standard_question,
                &meta.similar_questions.join(LIST_SEPARATOR),
                &meta.negative_questions.join(LIST_SEPARATOR),
                &meta.answers.join(LIST_SEPARATOR),
                upper_bool(meta.answer_strategy == AnswerStrategy::All),
                upper_bool(!chunk.is_enabled),
                upper_bool(!chunk.is_recommended()),
            ],
        );
    }
    out
}
