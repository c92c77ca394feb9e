//! Runtime names every generated module may use, described alongside the custom types.

use crate::execute::{SENTINEL_MODULE, SENTINEL_QUALNAME, SENTINEL_SOURCE};
use serde_json::{json, Map, Value};

pub const REST_HELPERS_MODULE: &str = "codespeak.public.rest_requests";

struct RestHelper {
    name: &'static str,
    signature: &'static str,
}

const REST_HELPERS: &[RestHelper] = &[
    RestHelper {
        name: "get",
        signature: "def get(api: str, path: str, path_params: Dict[str, Any] | None = None, query_params: Dict[str, Any] | None = None, headers: Dict[str, Any] = {}) -> Any",
    },
    RestHelper {
        name: "put",
        signature: "def put(api: str, path: str, path_params: Dict[str, Any] | None = None, query_params: Dict[str, Any] | None = None, data: Dict[str, Any] | None = None, json: Dict[str, Any] | None = None, cookies: Dict[str, Any] | None = None, headers: Dict[str, Any] = {}) -> Any",
    },
    RestHelper {
        name: "post",
        signature: "def post(api: str, path: str, path_params: Dict[str, Any] | None = None, query_params: Dict[str, Any] | None = None, data: Dict[str, Any] | None = None, json: Dict[str, Any] | None = None, cookies: Dict[str, Any] | None = None, headers: Dict[str, Any] = {}) -> Any",
    },
    RestHelper {
        name: "delete",
        signature: "def delete(api: str, path: str, path_params: Dict[str, Any] | None = None, query_params: Dict[str, Any] | None = None, headers: Dict[str, Any] = {}) -> Any",
    },
];

pub fn sentinel_import() -> String {
    format!("from {} import {}\n", SENTINEL_MODULE, SENTINEL_QUALNAME)
}

/// Add the sentinel exception and the REST helpers to a custom-types map.
pub fn add_runtime_types(types: &mut Map<String, Value>) {
    types.insert(
        format!("{}.{}", SENTINEL_MODULE, SENTINEL_QUALNAME),
        json!({
            "module": SENTINEL_MODULE,
            "qualname": SENTINEL_QUALNAME,
            "source_code": SENTINEL_SOURCE,
        }),
    );
    for helper in REST_HELPERS {
        types.insert(
            format!("{}.{}", REST_HELPERS_MODULE, helper.name),
            json!({
                "module": REST_HELPERS_MODULE,
                "qualname": helper.name,
                "signature": helper.signature,
                "description": format!(
                    "Makes a {} request to a registered api with automatic authentication and formatted params. No api keys required. Returns the json-encoded content of the response, if any.",
                    helper.name
                ),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_types_cover_sentinel_and_helpers() {
        let mut types = Map::new();
        add_runtime_types(&mut types);
        assert_eq!(types.len(), 5);
        let sentinel = &types["codespeak.InferredException"];
        assert!(sentinel["source_code"]
            .as_str()
            .unwrap()
            .contains("class InferredException(Exception)"));
        assert!(types["codespeak.public.rest_requests.post"]["signature"]
            .as_str()
            .unwrap()
            .starts_with("def post(api: str"));
        assert_eq!(sentinel_import(), "from codespeak import InferredException\n");
    }
}
