use serde::Deserialize;

/// Envelope of an item lookup call. On failure the API answers 200 with
/// `errorCode`/`errorMessage` instead of `item`.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponse {
    #[serde(default)]
    pub item: Vec<LookupItem>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LookupItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub pub_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub isbn13: Option<String>,
    #[serde(default)]
    pub price_standard: Option<i64>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub sub_info: Option<SubInfo>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubInfo {
    #[serde(default)]
    pub sub_title: Option<String>,
    #[serde(default)]
    pub item_page: Option<i64>,
    #[serde(default)]
    pub toc: Option<String>,
    #[serde(default)]
    pub authors: Vec<ItemAuthor>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemAuthor {
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_type: Option<String>,
    #[serde(default)]
    pub author_type_desc: Option<String>,
}
