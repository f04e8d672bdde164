//! Catalog of the requests understood by the agent.
//!
//! Every request is a static [`RequestDescriptor`]: the path segment, how the
//! caller's parameters become query pairs, how `(status, body)` becomes a
//! typed result, and whether the session cookie must be attached. Decoders
//! return `None`/`false` for anything they do not recognise.

use super::codec::{
    decode_catalog_page, decode_search_results, parse_action_result_line, parse_history_line,
    QueryParams,
};
use super::model::{
    AcceptDecision, ActionHistoryRecord, ActionRequest, AgentState, CatalogPage, CatalogQuery,
    KeyGrant, SearchResult,
};

const HTTP_OK: u16 = 200;
const HTTP_UNAUTHORIZED: u16 = 401;

/// Static description of one agent request.
pub struct RequestDescriptor<P, R> {
    pub name: &'static str,
    pub encode: fn(&P) -> QueryParams,
    pub decode: fn(u16, &str) -> R,
    pub requires_auth: bool,
}

impl<P, R> RequestDescriptor<P, R> {
    pub fn params(&self, params: &P) -> QueryParams {
        (self.encode)(params)
    }

    pub fn decode(&self, status: u16, body: &str) -> R {
        (self.decode)(status, body)
    }
}

pub const PING: RequestDescriptor<(), bool> = RequestDescriptor {
    name: "ping",
    encode: no_params,
    decode: succeeded,
    requires_auth: false,
};

/// Asks for control, optionally presenting a remembered access key.
pub const REQUEST_CONTROL: RequestDescriptor<Option<String>, Option<String>> =
    RequestDescriptor {
        name: "request_control",
        encode: access_key_param,
        decode: non_empty_body,
        requires_auth: false,
    };

pub const CONTROL_ACCEPTED: RequestDescriptor<(), Option<AcceptDecision>> = RequestDescriptor {
    name: "control_accepted",
    encode: no_params,
    decode: decode_accept_decision,
    requires_auth: true,
};

/// Pushes the backend URL the agent should attach to.
pub const FEED_CONFIGURATION: RequestDescriptor<Option<String>, bool> = RequestDescriptor {
    name: "feed_configuration",
    encode: backend_param,
    decode: succeeded,
    requires_auth: true,
};

pub const STATUS: RequestDescriptor<(), Option<AgentState>> = RequestDescriptor {
    name: "status",
    encode: no_params,
    decode: decode_agent_state,
    requires_auth: true,
};

pub const KEY_PERSISTENCE: RequestDescriptor<(), Option<KeyGrant>> = RequestDescriptor {
    name: "key_persistence",
    encode: no_params,
    decode: decode_key_grant,
    requires_auth: true,
};

pub const SEARCH_PRODUCTS: RequestDescriptor<(), bool> = RequestDescriptor {
    name: "search_products",
    encode: no_params,
    decode: succeeded,
    requires_auth: true,
};

pub const SEARCH_RESULTS: RequestDescriptor<(), Option<Vec<SearchResult>>> = RequestDescriptor {
    name: "search_results",
    encode: no_params,
    decode: decode_search_body,
    requires_auth: true,
};

pub const FETCH_CATALOG: RequestDescriptor<CatalogQuery, Option<CatalogPage>> =
    RequestDescriptor {
        name: "fetch_catalog",
        encode: catalog_params,
        decode: decode_catalog_body,
        requires_auth: true,
    };

/// A `null` body is an empty history, other non-200 answers are failures.
pub const ACTIONS_HISTORY: RequestDescriptor<(), Option<Vec<ActionHistoryRecord>>> =
    RequestDescriptor {
        name: "actions_history",
        encode: no_params,
        decode: decode_history_body,
        requires_auth: true,
    };

pub const PERFORM_ACTIONS: RequestDescriptor<ActionRequest, bool> = RequestDescriptor {
    name: "perform_actions",
    encode: action_params,
    decode: succeeded,
    requires_auth: true,
};

/// Yields `(cached product index, outcome code)` pairs in body order.
pub const ACTION_RESULTS: RequestDescriptor<(), Option<Vec<(usize, i32)>>> = RequestDescriptor {
    name: "action_results",
    encode: no_params,
    decode: decode_action_results_body,
    requires_auth: true,
};

fn no_params<P>(_: &P) -> QueryParams {
    QueryParams::new()
}

fn optional_param(name: &'static str, value: &Option<String>) -> QueryParams {
    let mut params = QueryParams::new();
    params.push_opt(name, value.clone());
    params
}

fn access_key_param(access_key: &Option<String>) -> QueryParams {
    optional_param("accessKey", access_key)
}

fn backend_param(backend: &Option<String>) -> QueryParams {
    optional_param("backend", backend)
}

fn succeeded(status: u16, _body: &str) -> bool {
    status == HTTP_OK
}

fn non_empty_body(status: u16, body: &str) -> Option<String> {
    let body = body.trim();
    (status == HTTP_OK && !body.is_empty()).then(|| body.to_string())
}

fn decode_accept_decision(status: u16, body: &str) -> Option<AcceptDecision> {
    if status == HTTP_OK {
        AcceptDecision::parse(body.trim())
    } else {
        None
    }
}

fn decode_agent_state(status: u16, body: &str) -> Option<AgentState> {
    if status == HTTP_OK {
        AgentState::parse(body.trim())
    } else {
        None
    }
}

fn decode_key_grant(status: u16, body: &str) -> Option<KeyGrant> {
    match status {
        HTTP_OK if !body.trim().is_empty() => Some(KeyGrant::Granted(body.trim().to_string())),
        HTTP_UNAUTHORIZED => Some(KeyGrant::Denied),
        _ => None,
    }
}

fn decode_search_body(status: u16, body: &str) -> Option<Vec<SearchResult>> {
    if status == HTTP_OK && body.trim() != "null" {
        Some(decode_search_results(body))
    } else {
        None
    }
}

fn decode_catalog_body(status: u16, body: &str) -> Option<CatalogPage> {
    (status == HTTP_OK).then(|| decode_catalog_page(body))
}

fn decode_history_body(status: u16, body: &str) -> Option<Vec<ActionHistoryRecord>> {
    if status != HTTP_OK {
        return None;
    }
    if body.trim() == "null" {
        return Some(Vec::new());
    }
    Some(body.lines().filter_map(parse_history_line).collect())
}

fn decode_action_results_body(status: u16, body: &str) -> Option<Vec<(usize, i32)>> {
    if status == HTTP_OK && body.trim() != "null" {
        Some(body.lines().filter_map(parse_action_result_line).collect())
    } else {
        None
    }
}

fn catalog_params(query: &CatalogQuery) -> QueryParams {
    let mut params = QueryParams::new();
    params.push("page", query.page.to_string());
    params.push("sort", query.sort.as_str());
    if query.descending {
        params.push("descendantSort", "true");
    }
    params.push_opt("search", query.search.clone());
    params
}

fn action_params(request: &ActionRequest) -> QueryParams {
    let mut params = QueryParams::new();
    params.push("action", request.kind().as_str());
    match request {
        ActionRequest::Update(indices) => {
            let list: Vec<String> = indices.iter().map(usize::to_string).collect();
            params.push("update_list", list.join(";"));
        }
        ActionRequest::Rollback(targets) => {
            let list: Vec<String> = targets
                .iter()
                .map(|target| format!("{}:{}", target.index, target.version.version_name))
                .collect();
            params.push("rollback_list", list.join(";"));
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::{ActionOutcome, CatalogSort, HybridInfo, RollbackTarget};

    #[test]
    fn auth_flags_match_the_protocol() {
        assert!(!PING.requires_auth);
        assert!(!REQUEST_CONTROL.requires_auth);
        assert!(CONTROL_ACCEPTED.requires_auth);
        assert!(STATUS.requires_auth);
        assert!(ACTION_RESULTS.requires_auth);
    }

    #[test]
    fn ping_is_truthy_only_on_200() {
        assert!(PING.decode(200, ""));
        assert!(!PING.decode(404, "ok"));
    }

    #[test]
    fn request_control_needs_a_non_empty_cookie() {
        assert_eq!(
            REQUEST_CONTROL.decode(200, "cookie-123\n"),
            Some("cookie-123".to_string())
        );
        assert_eq!(REQUEST_CONTROL.decode(200, "  \n"), None);
        assert_eq!(REQUEST_CONTROL.decode(403, "cookie"), None);
        assert!(REQUEST_CONTROL.params(&None).is_empty());
        assert_eq!(
            REQUEST_CONTROL
                .params(&Some("key".into()))
                .get("accessKey"),
            Some("key")
        );
    }

    #[test]
    fn control_accepted_recognises_three_answers() {
        assert_eq!(
            CONTROL_ACCEPTED.decode(200, "true\n"),
            Some(AcceptDecision::Accepted)
        );
        assert_eq!(CONTROL_ACCEPTED.decode(200, "wait"), Some(AcceptDecision::Wait));
        assert_eq!(
            CONTROL_ACCEPTED.decode(200, "false"),
            Some(AcceptDecision::Refused)
        );
        assert_eq!(CONTROL_ACCEPTED.decode(200, "maybe"), None);
        assert_eq!(CONTROL_ACCEPTED.decode(500, "true"), None);
    }

    #[test]
    fn status_trims_and_validates() {
        assert_eq!(STATUS.decode(200, " IDLE\n"), Some(AgentState::Idle));
        assert_eq!(STATUS.decode(200, "BUSY"), Some(AgentState::Busy));
        assert_eq!(
            STATUS.decode(200, "UNCONFIGURED"),
            Some(AgentState::Unconfigured)
        );
        assert_eq!(STATUS.decode(200, "idle"), None);
        assert_eq!(STATUS.decode(401, "IDLE"), None);
    }

    #[test]
    fn key_persistence_distinguishes_denial_from_failure() {
        assert_eq!(
            KEY_PERSISTENCE.decode(200, "abc"),
            Some(KeyGrant::Granted("abc".into()))
        );
        assert_eq!(KEY_PERSISTENCE.decode(401, ""), Some(KeyGrant::Denied));
        assert_eq!(KEY_PERSISTENCE.decode(200, ""), None);
        assert_eq!(KEY_PERSISTENCE.decode(500, "abc"), None);
    }

    #[test]
    fn search_results_reject_null_body() {
        assert_eq!(SEARCH_RESULTS.decode(200, "null"), None);
        assert_eq!(SEARCH_RESULTS.decode(200, ""), Some(vec![]));
        assert_eq!(SEARCH_RESULTS.decode(500, ""), None);
    }

    #[test]
    fn catalog_params_default_and_optional_fields() {
        let params = FETCH_CATALOG.params(&CatalogQuery::default());
        assert_eq!(params.to_query_string(), "?page=0&sort=name");

        let params = FETCH_CATALOG.params(&CatalogQuery {
            page: 3,
            sort: CatalogSort::Version,
            descending: true,
            search: Some("demo app".into()),
        });
        assert_eq!(
            params.to_query_string(),
            "?page=3&sort=version&descendantSort=true&search=demo%20app"
        );
    }

    #[test]
    fn catalog_decode_requires_200() {
        assert_eq!(FETCH_CATALOG.decode(404, "1\n"), None);
        let page = FETCH_CATALOG.decode(200, "2\n").expect("page");
        assert_eq!(page.page_count, Some(2));
        assert!(page.entries.is_empty());
    }

    #[test]
    fn history_decodes_lines_and_skips_malformed_ones() {
        let body = "Demo;1700000000000;1.0;1.1;core;false;0\nbroken line\nTool;;2.0;1.5;a,b;true;-1";
        let records = ACTIONS_HISTORY.decode(200, body).expect("history");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].product_name, "Tool");
        assert_eq!(records[1].status, Some(ActionOutcome::Failed));
        assert!(records[1].downgrade);

        assert_eq!(ACTIONS_HISTORY.decode(200, "null"), Some(vec![]));
        assert_eq!(ACTIONS_HISTORY.decode(503, ""), None);
    }

    #[test]
    fn update_list_joins_indices_with_semicolons() {
        let params = PERFORM_ACTIONS.params(&ActionRequest::Update(vec![0, 2]));
        assert_eq!(params.get("action"), Some("update"));
        assert_eq!(params.get("update_list"), Some("0;2"));
        assert_eq!(params.get("rollback_list"), None);
    }

    #[test]
    fn rollback_list_pairs_index_with_version() {
        let version = |name: &str| HybridInfo {
            version_name: name.into(),
            for_uninstall: true,
            install_date: None,
            release_date: None,
            description: None,
        };
        let params = PERFORM_ACTIONS.params(&ActionRequest::Rollback(vec![
            RollbackTarget {
                index: 1,
                version: version("1.2"),
            },
            RollbackTarget {
                index: 4,
                version: version("0.9"),
            },
        ]));
        assert_eq!(params.get("action"), Some("rollback"));
        assert_eq!(params.get("rollback_list"), Some("1:1.2;4:0.9"));
    }

    #[test]
    fn action_results_keep_body_order() {
        assert_eq!(
            ACTION_RESULTS.decode(200, "0=0\n1=-1\n2=1"),
            Some(vec![(0, 0), (1, -1), (2, 1)])
        );
        assert_eq!(ACTION_RESULTS.decode(200, "null"), None);
    }
}
