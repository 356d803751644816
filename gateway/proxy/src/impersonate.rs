//! `Impersonate-*` headers.

use http::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet};
use std::collections::BTreeMap;
use vcluster_gateway_core::{authn, Attributes, UserInfo};
use vcluster_gateway_k8s_api::StatusError;

const USER: &str = "impersonate-user";
const GROUP: &str = "impersonate-group";
const UID: &str = "impersonate-uid";
const EXTRA_PREFIX: &str = "impersonate-extra-";

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

// https://datatracker.ietf.org/doc/html/rfc7230#section-3.2.6
const ILLEGAL_IN_HEADER_NAME: &AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'(')
    .add(b')')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'{')
    .add(b'}');

const ILLEGAL_IN_HEADER_VALUE: &AsciiSet = &percent_encoding::CONTROLS.add(b' ').add(b'\t');

/// Whether any impersonation header is present.
pub fn requested(headers: &HeaderMap) -> bool {
    headers
        .keys()
        .any(|name| name.as_str().starts_with("impersonate-"))
}

/// Removes every impersonation header.
pub fn strip(headers: &mut HeaderMap) {
    let names = headers
        .keys()
        .filter(|name| name.as_str().starts_with("impersonate-"))
        .cloned()
        .collect::<Vec<_>>();
    for name in names {
        headers.remove(name);
    }
}

/// Reads the identity requested by impersonation headers.
pub fn parse(headers: &HeaderMap) -> Result<UserInfo, StatusError> {
    let value = |v: &HeaderValue| {
        v.to_str()
            .map(|s| s.to_string())
            .map_err(|_| StatusError::bad_request("invalid impersonation header value"))
    };

    let mut users = headers.get_all(USER).iter();
    let name = match (users.next(), users.next()) {
        (Some(user), None) => value(user)?,
        (None, _) => {
            return Err(StatusError::bad_request(
                "requested impersonation without an Impersonate-User header",
            ))
        }
        (Some(_), Some(_)) => {
            return Err(StatusError::bad_request(
                "only one Impersonate-User header is allowed",
            ))
        }
    };

    let groups = headers
        .get_all(GROUP)
        .iter()
        .map(value)
        .collect::<Result<Vec<_>, _>>()?;
    let uid = headers.get(UID).map(value).transpose()?.unwrap_or_default();

    let mut extra = BTreeMap::<String, Vec<String>>::new();
    for (header, v) in headers.iter() {
        if let Some(key) = header.as_str().strip_prefix(EXTRA_PREFIX) {
            let key = percent_decode_str(key).decode_utf8_lossy().into_owned();
            extra.entry(key).or_default().push(value(v)?);
        }
    }

    Ok(UserInfo {
        name,
        uid,
        groups,
        extra,
    })
}

/// The `impersonate` checks the requester must pass to act as `target`.
pub fn checks(requester: &UserInfo, target: &UserInfo) -> Vec<Attributes> {
    let check = |resource: &str, api_group: &str, namespace: &str, name: &str, subresource: &str| {
        Attributes {
            user: requester.clone(),
            verb: "impersonate".to_string(),
            resource_request: true,
            namespace: namespace.to_string(),
            api_group: api_group.to_string(),
            resource: resource.to_string(),
            subresource: subresource.to_string(),
            name: name.to_string(),
            ..Attributes::default()
        }
    };

    let mut attrs = Vec::new();
    match target
        .name
        .strip_prefix(SERVICE_ACCOUNT_PREFIX)
        .and_then(|sa| sa.split_once(':'))
    {
        Some((namespace, name)) => {
            attrs.push(check("serviceaccounts", "", namespace, name, ""));
        }
        None => attrs.push(check("users", "", "", &target.name, "")),
    }
    for group in &target.groups {
        attrs.push(check("groups", "", "", group, ""));
    }
    if !target.uid.is_empty() {
        attrs.push(check("uids", "authentication.k8s.io", "", &target.uid, ""));
    }
    for (key, values) in &target.extra {
        for value in values {
            attrs.push(check("userextras", "authentication.k8s.io", "", value, key));
        }
    }
    attrs
}

/// The identity the request acts as once impersonation is granted.
pub fn effective(mut target: UserInfo) -> UserInfo {
    if target.name == authn::ANONYMOUS_USER {
        if !target.groups.iter().any(|g| g == authn::UNAUTHENTICATED_GROUP) {
            target.groups.push(authn::UNAUTHENTICATED_GROUP.to_string());
        }
        return target;
    }
    if let Some((namespace, _)) = target
        .name
        .strip_prefix(SERVICE_ACCOUNT_PREFIX)
        .and_then(|sa| sa.split_once(':'))
    {
        if target.groups.is_empty() {
            target.groups = vec![
                "system:serviceaccounts".to_string(),
                format!("system:serviceaccounts:{namespace}"),
            ];
        }
    }
    if !target.groups.iter().any(|g| g == authn::AUTHENTICATED_GROUP) {
        target.groups.push(authn::AUTHENTICATED_GROUP.to_string());
    }
    target
}

/// Replaces any impersonation headers with ones acting as `user`.
pub fn set(headers: &mut HeaderMap, user: &UserInfo) -> Result<(), StatusError> {
    strip(headers);

    headers.append(USER, header_value(&user.name)?);
    for group in &user.groups {
        headers.append(GROUP, header_value(group)?);
    }
    if !user.uid.is_empty() {
        headers.append(UID, header_value(&user.uid)?);
    }
    for (key, values) in &user.extra {
        let encoded = utf8_percent_encode(&key.to_ascii_lowercase(), ILLEGAL_IN_HEADER_NAME).to_string();
        let name = HeaderName::try_from(format!("{EXTRA_PREFIX}{encoded}"))
            .map_err(|_| StatusError::bad_request(format!("invalid user extra key {key:?}")))?;
        for value in values {
            headers.append(name.clone(), header_value(value)?);
        }
    }
    Ok(())
}

fn header_value(input: &str) -> Result<HeaderValue, StatusError> {
    let encoded = utf8_percent_encode(input, ILLEGAL_IN_HEADER_VALUE).to_string();
    HeaderValue::try_from(encoded)
        .map_err(|_| StatusError::bad_request(format!("invalid impersonation value {input:?}")))
}
