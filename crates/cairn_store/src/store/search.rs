use std::cmp::Ordering;

use async_trait::async_trait;

use super::{GraphStore, element_visible, paginate, read_time};
use cairn_core::{
    CompiledCondition, ElementPage, ElementScan, FindByPropertyInput, FindByTextInput,
    GraphError, GraphResult, Guid, MetadataElement, PageCursor, PageRequest, PropertyValue,
    QueryOptions, SearchApi, SearchCondition, Sequencing, StatusFilter, ValueType,
    decode_cursor,
};

const KNOWN_DUPLICATE: &str = "KnownDuplicate";

struct SearchRequest<'a> {
    type_name: Option<&'a str>,
    condition: Option<CompiledCondition>,
    status_filter: &'a StatusFilter,
    anchor_scope: Option<Guid>,
    options: QueryOptions,
    sequencing: &'a Sequencing,
    page: &'a PageRequest,
}

fn is_descending(sequencing: &Sequencing) -> bool {
    matches!(
        sequencing,
        Sequencing::CreationDateRecent
            | Sequencing::LastUpdateRecent
            | Sequencing::PropertyDescending(_)
    )
}

fn sort_key(sequencing: &Sequencing, element: &MetadataElement) -> Option<PropertyValue> {
    match sequencing {
        Sequencing::Guid => None,
        Sequencing::CreationDateRecent | Sequencing::CreationDateOldest => {
            Some(PropertyValue::Time(element.header.created_at))
        }
        Sequencing::LastUpdateRecent => Some(PropertyValue::Time(element.header.updated_at)),
        Sequencing::PropertyAscending(name) | Sequencing::PropertyDescending(name) => {
            element.properties.get(name).cloned()
        }
    }
}

fn type_rank(value: &PropertyValue) -> u8 {
    match value.value_type() {
        ValueType::Bool => 0,
        ValueType::Int | ValueType::Float => 1,
        ValueType::Time => 2,
        ValueType::Str => 3,
        ValueType::StrArray => 4,
        ValueType::Map => 5,
    }
}

/// Total order used for sequencing and cursors: sort key in the requested
/// direction with missing keys last, then guid ascending.
fn compare_positions(
    sequencing: &Sequencing,
    a: (&Option<PropertyValue>, Guid),
    b: (&Option<PropertyValue>, Guid),
) -> Ordering {
    let by_key = match (a.0, b.0) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(left), Some(right)) => {
            let natural = left
                .compare(right)
                .unwrap_or_else(|| type_rank(left).cmp(&type_rank(right)));
            if is_descending(sequencing) {
                natural.reverse()
            } else {
                natural
            }
        }
    };
    by_key.then_with(|| a.1.cmp(&b.1))
}

impl GraphStore {
    async fn run_search(&self, request: SearchRequest<'_>) -> GraphResult<ElementPage> {
        let limit = self.page_limit(request.page.limit)?;
        let after = request.page.cursor.as_deref().map(decode_cursor).transpose()?;
        let type_names = match request.type_name {
            Some(name) => {
                self.entity_type(name)?;
                Some(self.registry.type_and_subtypes(name))
            }
            None => None,
        };
        let scan = ElementScan {
            type_names,
            anchor_guid: None,
        };
        let at = read_time(&request.options);

        let mut hits: Vec<(Option<PropertyValue>, MetadataElement)> = self
            .scan(&scan)
            .await?
            .iter()
            .filter_map(|record| {
                element_visible(record, &request.options, request.status_filter, at)
            })
            .filter(|element| {
                request.options.for_duplicate_processing || !element.is_classified(KNOWN_DUPLICATE)
            })
            .filter(|element| {
                request.anchor_scope.is_none_or(|scope| {
                    element.anchor_scope_guid == Some(scope) || element.anchor_guid == Some(scope)
                })
            })
            .filter(|element| {
                request
                    .condition
                    .as_ref()
                    .is_none_or(|condition| condition.matches(&element.properties))
            })
            .map(|element| (sort_key(request.sequencing, &element), element))
            .collect();

        hits.sort_by(|a, b| {
            compare_positions(request.sequencing, (&a.0, a.1.guid), (&b.0, b.1.guid))
        });
        if let Some(cursor) = &after {
            hits.retain(|(key, element)| {
                compare_positions(request.sequencing, (key, element.guid), (&cursor.key, cursor.guid))
                    == Ordering::Greater
            });
        }

        let (hits, next_cursor) = paginate(hits, limit, |(key, element)| PageCursor {
            key: key.clone(),
            guid: element.guid,
        })?;
        Ok(ElementPage {
            elements: hits.into_iter().map(|(_, element)| element).collect(),
            next_cursor,
        })
    }
}

#[async_trait]
impl SearchApi for GraphStore {
    async fn find_by_property(&self, input: FindByPropertyInput) -> GraphResult<ElementPage> {
        let condition = input
            .condition
            .as_ref()
            .map(SearchCondition::compile)
            .transpose()?;
        self.run_search(SearchRequest {
            type_name: input.type_name.as_deref(),
            condition,
            status_filter: &input.status_filter,
            anchor_scope: input.anchor_scope,
            options: input.options,
            sequencing: &input.sequencing,
            page: &input.page,
        })
        .await
    }

    async fn find_by_text(&self, input: FindByTextInput) -> GraphResult<ElementPage> {
        if input.pattern.is_empty() {
            return Err(GraphError::invalid("search pattern must not be empty"));
        }
        let condition = SearchCondition::text(&input.pattern).compile()?;
        self.run_search(SearchRequest {
            type_name: input.type_name.as_deref(),
            condition: Some(condition),
            status_filter: &input.status_filter,
            anchor_scope: input.anchor_scope,
            options: input.options,
            sequencing: &input.sequencing,
            page: &input.page,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::compare_positions;
    use cairn_core::{Guid, PropertyValue, Sequencing};

    #[test]
    fn missing_keys_sort_last_in_both_directions() {
        let a = Guid::new();
        let b = Guid::new();
        let some = Some(PropertyValue::Int(1));
        for sequencing in [
            Sequencing::PropertyAscending("size".to_string()),
            Sequencing::PropertyDescending("size".to_string()),
        ] {
            assert_eq!(
                compare_positions(&sequencing, (&some, a), (&None, b)),
                Ordering::Less
            );
        }
    }

    #[test]
    fn descending_reverses_key_but_not_guid_tiebreak() {
        let (low, high) = {
            let x = Guid::new();
            let y = Guid::new();
            if x < y { (x, y) } else { (y, x) }
        };
        let one = Some(PropertyValue::Int(1));
        let two = Some(PropertyValue::Int(2));
        let desc = Sequencing::PropertyDescending("size".to_string());
        assert_eq!(compare_positions(&desc, (&two, high), (&one, low)), Ordering::Less);
        assert_eq!(compare_positions(&desc, (&one, low), (&one, high)), Ordering::Less);
    }
}
