use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::core::{Bound, CompositeOperator, Direction, FieldFilter, Filter, Operator, OrderBy, Target};
use crate::error::{invalid_argument, FirestoreResult};
use crate::local::TargetData;
use crate::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, Mutation, MutationResult,
    Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between the model and the JSON mapping of the Firestore protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

/// Decoded `WriteResponse`.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.database_id.document_name(key)
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        self.database_id.document_key_from_name(name)
    }

    // Values

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            // Pending server timestamps never leave the client; the transform carries them.
            ValueKind::Null | ValueKind::ServerTimestamp(_) => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => encode_double(*double),
            ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(reference) => {
                let name = match ResourcePath::from_string(reference) {
                    Ok(path) => self.database_id.resource_name(&path),
                    Err(_) => reference.clone(),
                };
                json!({ "referenceValue": name })
            }
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values: Vec<JsonValue> = array.values().iter().map(|value| self.encode_value(value)).collect();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({ "mapValue": { "fields": self.encode_fields(map) } }),
        }
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        let fields: JsonMap<String, JsonValue> = map
            .fields()
            .iter()
            .map(|(key, value)| (key.clone(), self.encode_value(value)))
            .collect();
        JsonValue::Object(fields)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => {
                    i64::from_str(value).map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?
                }
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            let parsed = match double_value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
                JsonValue::String(value) => match value.as_str() {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    other => other
                        .parse::<f64>()
                        .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                },
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FirestoreValue::from_double(parsed));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            let timestamp = timestamp_value
                .as_str()
                .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
            return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp)?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let value = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(value));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            let encoded = bytes_value
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
            let bytes =
                BytesValue::from_base64(encoded).map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FirestoreValue::from_bytes(bytes));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            let path = self.database_id.resource_path_from_name(name)?;
            return Ok(FirestoreValue::from_reference(path.canonical_string()));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point.get("latitude").and_then(JsonValue::as_f64).unwrap_or(0.0);
            let longitude = geo_point.get("longitude").and_then(JsonValue::as_f64).unwrap_or(0.0);
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            let values = match array_value.get("values").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(FirestoreValue::from_array(values));
        }
        if let Some(map_value) = object.get("mapValue") {
            return Ok(FirestoreValue::from_map_value(self.decode_fields(map_value.get("fields"))?));
        }
        Err(invalid_argument("Unknown Firestore value type"))
    }

    /// Decodes a `fields` object; a missing object is an empty map.
    pub fn decode_fields(&self, fields: Option<&JsonValue>) -> FirestoreResult<MapValue> {
        let Some(fields) = fields else {
            return Ok(MapValue::empty());
        };
        let object = fields
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
        let mut decoded = BTreeMap::new();
        for (name, value) in object {
            decoded.insert(name.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(decoded))
    }

    // Versions

    pub fn encode_version(&self, version: &SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        parse_timestamp(value).map(SnapshotVersion::new)
    }

    fn decode_optional_version(&self, value: Option<&JsonValue>) -> FirestoreResult<Option<SnapshotVersion>> {
        value
            .and_then(JsonValue::as_str)
            .map(|timestamp| self.decode_version(timestamp))
            .transpose()
    }

    // Documents

    pub fn encode_document(&self, document: &Document) -> JsonValue {
        let mut encoded = JsonMap::new();
        encoded.insert("name".to_string(), json!(self.document_name(document.key())));
        encoded.insert("fields".to_string(), self.encode_fields(document.data()));
        encoded.insert("updateTime".to_string(), json!(self.encode_version(&document.version())));
        if !document.create_time().is_min() {
            encoded.insert("createTime".to_string(), json!(self.encode_version(&document.create_time())));
        }
        JsonValue::Object(encoded)
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self
            .decode_optional_version(value.get("updateTime"))?
            .ok_or_else(|| invalid_argument("Document missing updateTime"))?;
        let data = self.decode_fields(value.get("fields"))?;
        let mut document = Document::new_found_document(key, version, data);
        if let Some(create_time) = self.decode_optional_version(value.get("createTime"))? {
            document.set_create_time(create_time);
        }
        Ok(document)
    }

    // Mutations

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation {
            Mutation::Set(set) => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": self.document_name(&set.key), "fields": self.encode_fields(&set.value) }),
                );
            }
            Mutation::Patch(patch) => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": self.document_name(&patch.key), "fields": self.encode_fields(&patch.data) }),
                );
                write.insert("updateMask".to_string(), encode_field_mask(&patch.field_mask));
            }
            Mutation::Delete(delete) => {
                write.insert("delete".to_string(), json!(self.document_name(&delete.key)));
            }
            Mutation::Verify(verify) => {
                write.insert("verify".to_string(), json!(self.document_name(&verify.key)));
            }
        }
        if !mutation.field_transforms().is_empty() {
            let transforms: Vec<JsonValue> = mutation
                .field_transforms()
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(&mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            Some(current) => self.decode_precondition(current)?,
            None => Precondition::None,
        };
        let transforms = match value.get("updateTransforms").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_field_transform(entry))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        let mutation = if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update write missing name"))?;
            let key = self.document_key_from_name(name)?;
            let data = self.decode_fields(update.get("fields"))?;
            match value.get("updateMask") {
                Some(mask) => Mutation::patch(key, data, decode_field_mask(mask)?),
                None => Mutation::set(key, data),
            }
        } else if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            Mutation::delete(self.document_key_from_name(name)?)
        } else if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            Mutation::verify(self.document_key_from_name(name)?, precondition)
        } else {
            return Err(invalid_argument("Unknown write operation"));
        };
        Ok(mutation.with_precondition(precondition).with_transforms(transforms))
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": self.encode_values(elements) }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": self.encode_values(elements) }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform missing fieldPath"))
            .and_then(FieldPath::from_dot_separated)?;
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(self.decode_values(union.get("values"))?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(self.decode_values(remove.get("values"))?)
        } else if let Some(increment) = value.get("increment") {
            TransformOperation::NumericIncrement(self.decode_value(increment)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field, operation))
    }

    fn encode_values(&self, values: &[FirestoreValue]) -> Vec<JsonValue> {
        values.iter().map(|value| self.encode_value(value)).collect()
    }

    fn decode_values(&self, values: Option<&JsonValue>) -> FirestoreResult<Vec<FirestoreValue>> {
        match values.and_then(JsonValue::as_array) {
            Some(entries) => entries.iter().map(|entry| self.decode_value(entry)).collect(),
            None => Ok(Vec::new()),
        }
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => Some(json!({ "updateTime": self.encode_version(version) })),
        }
    }

    fn decode_precondition(&self, value: &JsonValue) -> FirestoreResult<Precondition> {
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        match self.decode_optional_version(value.get("updateTime"))? {
            Some(version) => Ok(Precondition::UpdateTime(version)),
            None => Ok(Precondition::None),
        }
    }

    // Write stream

    /// First request on a write stream; carries no writes.
    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        let writes: Vec<JsonValue> = mutations.iter().map(|mutation| self.encode_mutation(mutation)).collect();
        json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        })
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = decode_bytes(value.get("streamToken"))?;
        let commit_version = self.decode_optional_version(value.get("commitTime"))?.unwrap_or_default();
        let mutation_results = match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| self.decode_write_result(result, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }

    fn decode_write_result(&self, value: &JsonValue, commit_version: SnapshotVersion) -> FirestoreResult<MutationResult> {
        // Deletes of missing documents carry no update time.
        let version = self
            .decode_optional_version(value.get("updateTime"))?
            .unwrap_or(commit_version);
        let transform_results = self.decode_values(value.get("transformResults"))?;
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    // Listen stream

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        })
    }

    pub fn encode_unlisten_request(&self, target_id: i32) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = JsonMap::new();
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.database_id.resource_name(&target.path)] }),
            );
        } else {
            encoded.insert("query".to_string(), self.encode_query_target(target));
        }
        encoded.insert("targetId".to_string(), json!(target_data.target_id));

        if !target_data.resume_token.is_empty() {
            encoded.insert("resumeToken".to_string(), json!(BASE64_STANDARD.encode(&target_data.resume_token)));
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(&target_data.snapshot_version)),
            );
        }
        if let Some(expected_count) = target_data.expected_count {
            encoded.insert("expectedCount".to_string(), json!(expected_count));
        }
        JsonValue::Object(encoded)
    }

    fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = JsonMap::new();
        let parent = match &target.collection_group {
            Some(group) => {
                structured.insert(
                    "from".to_string(),
                    json!([{ "collectionId": group, "allDescendants": true }]),
                );
                target.path.clone()
            }
            None => {
                structured.insert(
                    "from".to_string(),
                    json!([{ "collectionId": target.path.last_segment().unwrap_or_default() }]),
                );
                target.path.without_last()
            }
        };

        if let Some(filter) = self.encode_filters(&target.filters) {
            structured.insert("where".to_string(), filter);
        }
        if !target.order_by.is_empty() {
            let orders: Vec<JsonValue> = target.order_by.iter().map(encode_order_by).collect();
            structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(start) = &target.start_at {
            structured.insert("startAt".to_string(), self.encode_bound(start, start.inclusive));
        }
        if let Some(end) = &target.end_at {
            structured.insert("endAt".to_string(), self.encode_bound(end, !end.inclusive));
        }

        json!({
            "parent": self.database_id.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    fn encode_filters(&self, filters: &[Filter]) -> Option<JsonValue> {
        match filters {
            [] => None,
            [single] => Some(self.encode_filter(single)),
            many => Some(self.encode_filter(&Filter::and(many.to_vec()))),
        }
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field_filter) => self.encode_field_filter(field_filter),
            Filter::Composite(composite) => {
                let op = match composite.op() {
                    CompositeOperator::And => "AND",
                    CompositeOperator::Or => "OR",
                };
                let filters: Vec<JsonValue> = composite.filters().iter().map(|f| self.encode_filter(f)).collect();
                json!({ "compositeFilter": { "op": op, "filters": filters } })
            }
        }
    }

    fn encode_field_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match (filter.op(), filter.value().kind()) {
            (Operator::Equal, ValueKind::Null) => Some("IS_NULL"),
            (Operator::NotEqual, ValueKind::Null) => Some("IS_NOT_NULL"),
            (Operator::Equal, _) if filter.value().is_nan() => Some("IS_NAN"),
            (Operator::NotEqual, _) if filter.value().is_nan() => Some("IS_NOT_NAN"),
            _ => None,
        };
        match unary {
            Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
            None => json!({
                "fieldFilter": {
                    "field": field,
                    "op": operator_name(filter.op()),
                    "value": self.encode_value(filter.value()),
                }
            }),
        }
    }

    fn encode_bound(&self, bound: &Bound, before: bool) -> JsonValue {
        json!({
            "values": self.encode_values(&bound.position),
            "before": before,
        })
    }

    /// Decodes an `addTarget` payload. Used by backends speaking to this client.
    pub fn decode_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        if let Some(documents) = value.get("documents") {
            let name = documents
                .get("documents")
                .and_then(JsonValue::as_array)
                .and_then(|names| names.first())
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("documents target must name one document"))?;
            return Ok(Target::for_document(&self.document_key_from_name(name)?));
        }
        let query = value
            .get("query")
            .ok_or_else(|| invalid_argument("target has neither query nor documents"))?;
        let parent = query
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("query target missing parent"))?;
        let parent = self.database_id.resource_path_from_name(parent)?;
        let structured = query
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("query target missing structuredQuery"))?;

        let from = structured
            .get("from")
            .and_then(JsonValue::as_array)
            .and_then(|from| from.first())
            .ok_or_else(|| invalid_argument("structuredQuery missing from"))?;
        let collection_id = from
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("structuredQuery missing collectionId"))?;
        let all_descendants = from.get("allDescendants").and_then(JsonValue::as_bool).unwrap_or(false);
        let (path, collection_group) = if all_descendants {
            (parent, Some(collection_id.to_string()))
        } else {
            (parent.child([collection_id]), None)
        };

        let filters = match structured.get("where") {
            Some(filter) => vec![self.decode_filter(filter)?],
            None => Vec::new(),
        };
        let order_by = match structured.get("orderBy").and_then(JsonValue::as_array) {
            Some(orders) => orders.iter().map(decode_order_by).collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let limit = structured.get("limit").and_then(JsonValue::as_u64).map(|limit| limit as u32);
        let start_at = structured
            .get("startAt")
            .map(|bound| self.decode_bound(bound, true))
            .transpose()?;
        let end_at = structured
            .get("endAt")
            .map(|bound| self.decode_bound(bound, false))
            .transpose()?;

        Ok(Target::new(path, collection_group, filters, order_by, limit, start_at, end_at))
    }

    fn decode_filter(&self, value: &JsonValue) -> FirestoreResult<Filter> {
        if let Some(composite) = value.get("compositeFilter") {
            let filters = composite
                .get("filters")
                .and_then(JsonValue::as_array)
                .map(|filters| filters.iter().map(|f| self.decode_filter(f)).collect::<FirestoreResult<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            return match composite.get("op").and_then(JsonValue::as_str) {
                Some("OR") => Ok(Filter::or(filters)),
                _ => Ok(Filter::and(filters)),
            };
        }
        if let Some(unary) = value.get("unaryFilter") {
            let field = decode_field_reference(unary.get("field"))?;
            let (op, operand) = match unary.get("op").and_then(JsonValue::as_str) {
                Some("IS_NULL") => (Operator::Equal, FirestoreValue::null()),
                Some("IS_NOT_NULL") => (Operator::NotEqual, FirestoreValue::null()),
                Some("IS_NAN") => (Operator::Equal, FirestoreValue::from_double(f64::NAN)),
                Some("IS_NOT_NAN") => (Operator::NotEqual, FirestoreValue::from_double(f64::NAN)),
                other => return Err(invalid_argument(format!("Unknown unary filter op {other:?}"))),
            };
            return Filter::field(field, op, operand);
        }
        let field_filter = value
            .get("fieldFilter")
            .ok_or_else(|| invalid_argument("Unknown filter type"))?;
        let field = decode_field_reference(field_filter.get("field"))?;
        let op = field_filter
            .get("op")
            .and_then(JsonValue::as_str)
            .and_then(operator_from_name)
            .ok_or_else(|| invalid_argument("Unknown field filter op"))?;
        let operand = field_filter
            .get("value")
            .ok_or_else(|| invalid_argument("field filter missing value"))
            .and_then(|operand| self.decode_value(operand))?;
        Filter::field(field, op, operand)
    }

    fn decode_bound(&self, value: &JsonValue, is_start: bool) -> FirestoreResult<Bound> {
        let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
        let position = self.decode_values(value.get("values"))?;
        Ok(Bound::new(position, if is_start { before } else { !before }))
    }
}

fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!({ "doubleValue": "NaN" })
    } else if value.is_infinite() {
        json!({ "doubleValue": if value > 0.0 { "Infinity" } else { "-Infinity" } })
    } else {
        json!({ "doubleValue": value })
    }
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    let paths: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
    json!({ "fieldPaths": paths })
}

fn decode_field_mask(value: &JsonValue) -> FirestoreResult<FieldMask> {
    let paths = value
        .get("fieldPaths")
        .and_then(JsonValue::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(JsonValue::as_str)
                .map(FieldPath::from_dot_separated)
                .collect::<FirestoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(FieldMask::new(paths))
}

fn encode_order_by(order: &OrderBy) -> JsonValue {
    let direction = match order.direction {
        Direction::Ascending => "ASCENDING",
        Direction::Descending => "DESCENDING",
    };
    json!({
        "field": { "fieldPath": order.field.canonical_string() },
        "direction": direction,
    })
}

fn decode_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = decode_field_reference(value.get("field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        Some("DESCENDING") => Direction::Descending,
        _ => Direction::Ascending,
    };
    Ok(OrderBy::new(field, direction))
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("missing fieldPath"))
        .and_then(FieldPath::from_dot_separated)
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::In => "IN",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::NotIn => "NOT_IN",
    }
}

fn operator_from_name(name: &str) -> Option<Operator> {
    let op = match name {
        "LESS_THAN" => Operator::LessThan,
        "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
        "EQUAL" => Operator::Equal,
        "NOT_EQUAL" => Operator::NotEqual,
        "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
        "GREATER_THAN" => Operator::GreaterThan,
        "ARRAY_CONTAINS" => Operator::ArrayContains,
        "IN" => Operator::In,
        "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
        "NOT_IN" => Operator::NotIn,
        _ => return None,
    };
    Some(op)
}

pub(crate) fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32).single() {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00.000000000Z".to_string(),
    }
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime =
        DateTime::parse_from_rfc3339(value).map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(datetime.timestamp(), datetime.timestamp_subsec_nanos() as i32))
}
