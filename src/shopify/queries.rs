//! Admin GraphQL documents.

/// Bulk document for the full product catalog. Nested connections come back as
/// flat lines tagged with `__parentId`.
pub const PRODUCTS_BULK: &str = r#"
{
  products {
    edges {
      node {
        id
        title
        status
        descriptionHtml
        tags
        options { name values }
        images {
          edges { node { id url altText } }
        }
        variants {
          edges {
            node {
              id
              title
              sku
              price
              inventoryQuantity
              selectedOptions { name value }
              metafields {
                edges { node { id namespace key value type } }
              }
            }
          }
        }
        metafields {
          edges { node { id namespace key value type } }
        }
        collections {
          edges { node { id title } }
        }
      }
    }
  }
}
"#;

pub const COLLECTIONS_BULK: &str = r#"
{
  collections {
    edges {
      node {
        id
        title
        handle
        descriptionHtml
      }
    }
  }
}
"#;

pub const CURRENT_BULK_OPERATION: &str = r#"
query {
  currentBulkOperation {
    id
    status
    errorCode
    url
  }
}
"#;

pub const BULK_RUN_QUERY: &str = r#"
mutation bulkRun($query: String!) {
  bulkOperationRunQuery(query: $query) {
    bulkOperation { id status }
    userErrors { field message }
  }
}
"#;

pub const BULK_CANCEL: &str = r#"
mutation bulkCancel($id: ID!) {
  bulkOperationCancel(id: $id) {
    bulkOperation { id status }
    userErrors { field message }
  }
}
"#;
