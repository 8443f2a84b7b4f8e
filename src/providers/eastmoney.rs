use crate::core::config::EastMoneyProviderConfig;
use crate::core::fund::{FundCode, FundDirectorySource, FundProfile};
use crate::core::market::{Estimation, MarketDataProvider, OfficialChange};
use crate::providers::util::{extract_js_var, fetch_text, js_string};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

/// Fund pages publish timestamps as midnight China Standard Time.
const CST_OFFSET_SECS: i32 = 8 * 3600;

/// Estimates from fundgz, official changes, profiles and the code list from
/// the fund detail site. Every fetch is a single attempt bounded by the
/// client timeout.
pub struct EastMoneyProvider {
    client: Client,
    estimate_url: String,
    detail_url: String,
}

impl EastMoneyProvider {
    pub fn new(config: &EastMoneyProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (fundwatch)")
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            estimate_url: config.estimate_url.trim_end_matches('/').to_string(),
            detail_url: config.detail_url.trim_end_matches('/').to_string(),
        })
    }

    async fn detail_script(&self, code: &FundCode) -> Option<String> {
        let url = format!("{}/pingzhongdata/{}.js", self.detail_url, code);
        fetch_text(&self.client, &url).await
    }
}

#[derive(Debug, Deserialize)]
struct GzPayload {
    name: Option<String>,
    #[serde(default)]
    gszzl: Option<Value>,
    gztime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetWorthPoint {
    x: i64,
    y: Option<Value>,
    #[serde(rename = "equityReturn")]
    equity_return: Option<Value>,
}

/// Numbers arrive both as JSON numbers and as numeric strings.
fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn parse_estimation(body: &str) -> Option<Estimation> {
    let payload = body
        .trim()
        .strip_prefix("jsonpgz(")?
        .strip_suffix(';')?
        .trim_end()
        .strip_suffix(')')?;
    let gz: GzPayload = serde_json::from_str(payload).ok()?;
    // A blank or non-numeric change still settles, at zero.
    Some(Estimation {
        pct: gz.gszzl.as_ref().and_then(number).unwrap_or(0.0),
        as_of: gz
            .gztime
            .and_then(|t| NaiveDateTime::parse_from_str(&t, "%Y-%m-%d %H:%M").ok()),
        name: gz.name.filter(|n| !n.is_empty()),
    })
}

fn parse_official_change(script: &str) -> Option<OfficialChange> {
    let raw = extract_js_var(script, "Data_netWorthTrend")?;
    let points: Vec<NetWorthPoint> = serde_json::from_str(raw).ok()?;
    let last = points.last()?;
    let offset = FixedOffset::east_opt(CST_OFFSET_SECS)?;
    let date = DateTime::from_timestamp_millis(last.x)?
        .with_timezone(&offset)
        .date_naive();
    Some(OfficialChange {
        date,
        nav: last.y.as_ref().and_then(number),
        pct: last.equity_return.as_ref().and_then(number).unwrap_or(0.0),
    })
}

fn parse_managers(raw: &str) -> Vec<String> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            item.get("name")
                .or_else(|| item.get("managerName"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_profile(code: &FundCode, script: &str) -> Option<FundProfile> {
    extract_js_var(script, "fS_code")?;
    let text = |name: &str| extract_js_var(script, name).and_then(js_string);
    let managers = ["Data_fundManager", "Data_currentFundManager"]
        .into_iter()
        .filter_map(|var| extract_js_var(script, var))
        .map(parse_managers)
        .find(|names| !names.is_empty())
        .unwrap_or_default();
    Some(FundProfile {
        code: code.clone(),
        name: text("fS_name").filter(|n| !n.is_empty())?,
        fund_type: text("fS_type").filter(|t| !t.is_empty()),
        company: text("fundCompany").filter(|c| !c.is_empty()),
        managers,
    })
}

/// `var r = [[code, abbreviation, name, type, pinyin], ...];`
fn parse_fund_codes(script: &str) -> Option<Vec<FundProfile>> {
    let raw = extract_js_var(script, "r")?;
    let rows: Vec<Vec<Value>> = serde_json::from_str(raw).ok()?;
    let field = |row: &Vec<Value>, i: usize| {
        row.get(i)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let funds: Vec<FundProfile> = rows
        .iter()
        .filter_map(|row| {
            Some(FundProfile {
                code: field(row, 0).and_then(|c| FundCode::parse(&c))?,
                name: field(row, 2)?,
                fund_type: field(row, 3),
                company: None,
                managers: Vec::new(),
            })
        })
        .collect();
    (!funds.is_empty()).then_some(funds)
}

#[async_trait]
impl MarketDataProvider for EastMoneyProvider {
    #[instrument(name = "Estimation", skip_all, fields(code = %code))]
    async fn fetch_estimation(&self, code: &FundCode) -> Option<Estimation> {
        let url = format!("{}/js/{}.js", self.estimate_url, code);
        let body = fetch_text(&self.client, &url).await?;
        let estimation = parse_estimation(&body);
        if estimation.is_none() {
            debug!("Unusable estimate payload");
        }
        estimation
    }

    #[instrument(name = "OfficialChange", skip_all, fields(code = %code))]
    async fn fetch_official_change(&self, code: &FundCode) -> Option<OfficialChange> {
        let script = self.detail_script(code).await?;
        let change = parse_official_change(&script);
        if change.is_none() {
            debug!("No net worth trend in detail script");
        }
        change
    }
}

#[async_trait]
impl FundDirectorySource for EastMoneyProvider {
    #[instrument(name = "Profile", skip_all, fields(code = %code))]
    async fn fetch_profile(&self, code: &FundCode) -> Option<FundProfile> {
        let script = self.detail_script(code).await?;
        parse_profile(code, &script)
    }

    #[instrument(name = "FundCodes", skip_all)]
    async fn fetch_fund_codes(&self) -> Option<Vec<FundProfile>> {
        let url = format!("{}/js/fundcode_search.js", self.detail_url);
        let script = fetch_text(&self.client, &url).await?;
        let funds = parse_fund_codes(&script);
        debug!(count = funds.as_ref().map_or(0, Vec::len), "Parsed fund code list");
        funds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DETAIL_SCRIPT: &str = r#"/*2024-06-04 10:00:00*/var ishb=false;var fS_name = "华夏成长混合";var fS_code = "000001";var fS_type = '混合型-偏股';var fundCompany = "华夏基金";
var Data_netWorthTrend = [{"x":1717257600000,"y":1.1,"equityReturn":-0.3,"unitMoney":""},{"x":1717344000000,"y":1.2345,"equityReturn":0.52,"unitMoney":""}];
var Data_currentFundManager =[{"id":"30198442","pic":"","name":"王泽实","star":3}];"#;

    async fn mock_server(route: &str, body: &str, status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    fn provider(server: &MockServer) -> EastMoneyProvider {
        EastMoneyProvider::new(&EastMoneyProviderConfig {
            estimate_url: server.uri(),
            detail_url: server.uri(),
            timeout_secs: 1,
        })
        .unwrap()
    }

    fn code(raw: &str) -> FundCode {
        FundCode::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_estimation_from_jsonp() {
        let body = r#"jsonpgz({"fundcode":"000001","name":"华夏成长混合","jzrq":"2024-06-03","dwjz":"1.2345","gsz":"1.2400","gszzl":"0.45","gztime":"2024-06-04 15:00"});"#;
        let server = mock_server("/js/000001.js", body, 200).await;

        let estimation = provider(&server)
            .fetch_estimation(&code("000001"))
            .await
            .unwrap();
        assert_eq!(estimation.pct, 0.45);
        assert_eq!(estimation.name.as_deref(), Some("华夏成长混合"));
        assert_eq!(
            estimation.as_of,
            NaiveDate::from_ymd_opt(2024, 6, 4).unwrap().and_hms_opt(15, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_fetch_estimation_empty_or_failed_is_none() {
        let server = mock_server("/js/000001.js", "jsonpgz();", 200).await;
        assert!(provider(&server).fetch_estimation(&code("000001")).await.is_none());

        let server = mock_server("/js/000001.js", "Server Error", 500).await;
        assert!(provider(&server).fetch_estimation(&code("000001")).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_estimation_without_numeric_change_is_zero() {
        let body = r#"jsonpgz({"fundcode":"000001","name":"华夏成长混合","gszzl":"","gztime":"2024-06-04 15:00"});"#;
        let server = mock_server("/js/000001.js", body, 200).await;
        let estimation = provider(&server)
            .fetch_estimation(&code("000001"))
            .await
            .unwrap();
        assert_eq!(estimation.pct, 0.0);
        assert_eq!(estimation.name.as_deref(), Some("华夏成长混合"));

        let server = mock_server("/js/000001.js", r#"jsonpgz({"fundcode":"000001"});"#, 200).await;
        let estimation = provider(&server)
            .fetch_estimation(&code("000001"))
            .await
            .unwrap();
        assert_eq!(estimation.pct, 0.0);
    }

    #[tokio::test]
    async fn test_fetch_estimation_times_out_as_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/js/000001.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"jsonpgz({"gszzl":"1.0"});"#)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        assert!(provider(&server).fetch_estimation(&code("000001")).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_official_change_uses_last_point() {
        let server = mock_server("/pingzhongdata/000001.js", DETAIL_SCRIPT, 200).await;
        let change = provider(&server)
            .fetch_official_change(&code("000001"))
            .await
            .unwrap();

        assert_eq!(change.date, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(change.nav, Some(1.2345));
        assert_eq!(change.pct, 0.52);
    }

    #[tokio::test]
    async fn test_fetch_profile() {
        let server = mock_server("/pingzhongdata/000001.js", DETAIL_SCRIPT, 200).await;
        let profile = provider(&server)
            .fetch_profile(&code("000001"))
            .await
            .unwrap();

        assert_eq!(profile.name, "华夏成长混合");
        assert_eq!(profile.fund_type.as_deref(), Some("混合型-偏股"));
        assert_eq!(profile.company.as_deref(), Some("华夏基金"));
        assert_eq!(profile.managers, vec!["王泽实".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_profile_rejects_unrelated_script() {
        let server = mock_server("/pingzhongdata/000001.js", "var foo = 1;", 200).await;
        assert!(provider(&server).fetch_profile(&code("000001")).await.is_none());
        assert!(
            provider(&server)
                .fetch_official_change(&code("000001"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_fetch_fund_codes() {
        let body = r#"var r = [["000001","HXCZHH","华夏成长混合","混合型-灵活","HUAXIACHENGZHANGHUNHE"],["000003","ZHKZZZQA","中海可转债债券A","债券型-混合二级","ZHONGHAIKEZHUANZHAIZHAIQUANA"],["","X","无代码","",""]];"#;
        let server = mock_server("/js/fundcode_search.js", body, 200).await;

        let funds = provider(&server).fetch_fund_codes().await.unwrap();
        assert_eq!(funds.len(), 2);
        assert_eq!(funds[1].code.as_str(), "000003");
        assert_eq!(funds[1].name, "中海可转债债券A");
        assert_eq!(funds[1].fund_type.as_deref(), Some("债券型-混合二级"));
    }
}
