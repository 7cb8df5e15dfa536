use crate::model::DistrictName;

const QUERY_SEPARATOR: &str = ", ";

/// Fixed region/country suffix appended to every lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryQualifier {
    pub region: String,
    pub country: String,
}

impl QueryQualifier {
    pub fn new(region: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            country: country.into(),
        }
    }
}

pub fn build_query(name: &DistrictName, qualifier: &QueryQualifier) -> String {
    [
        name.as_str(),
        qualifier.region.as_str(),
        qualifier.country.as_str(),
    ]
    .join(QUERY_SEPARATOR)
}
