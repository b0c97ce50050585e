//! Statement recipes over the built-in station catalog.
//!
//! Each recipe expands the request's select and filter within a fixed
//! scope and assembles the statement around it. Tree representations also
//! carry the hierarchy the rows are ordered by, ready for [`build_tree`].
//! Node recipes refuse edge representations and the other way round.

use crate::error::{QueryError, Result};
use crate::expansion::{Expansion, SelectExpansion};
use crate::operator::TypeClass;
use crate::result_builder::{build_tree, ResultBuilderConfig, Row, RowNormalizer};
use crate::schema::Schema;
use crate::sql_compiler::{ParamValue, Params, Statement, StatementBuilder};
use sea_query::Value;
use std::str::FromStr;
use tracing::debug;

const STATION_SCOPE: [&str; 2] = ["station", "parent"];
const STATION_TYPE_SCOPE: [&str; 3] = ["station", "parent", "datatype"];
const MEASUREMENT_DOUBLE_SCOPE: [&str; 5] = [
    "station",
    "parent",
    "measurementdouble",
    "measurement",
    "datatype",
];
const MEASUREMENT_STRING_SCOPE: [&str; 5] = [
    "station",
    "parent",
    "measurementstring",
    "measurement",
    "datatype",
];

const EDGE_SCOPE: [&str; 3] = ["edge", "stationbegin", "stationend"];

const STATION_KEYS: &str = "s.stationtype as _stationtype, s.stationcode as _stationcode";
const DATATYPE_KEYS: &str =
    "s.stationtype as _stationtype, s.stationcode as _stationcode, t.cname as _datatypename";
const EDGE_KEYS: &str = "i.stationtype as _stationtype, i.stationcode as _stationcode";

/// Output shape and subject of a recipe: rows or a tree, of stations
/// (nodes) or of the edges between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Representation {
    #[default]
    Flat,
    Tree,
    FlatEdge,
    TreeEdge,
}

impl Representation {
    pub fn is_flat(&self) -> bool {
        matches!(self, Representation::Flat | Representation::FlatEdge)
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, Representation::FlatEdge | Representation::TreeEdge)
    }
}

impl FromStr for Representation {
    type Err = QueryError;

    /// `flat` or `tree`, optionally followed by `,node` or `,edge`.
    fn from_str(s: &str) -> Result<Self> {
        let (shape, subject) = s.split_once(',').unwrap_or((s, "node"));
        match (shape.trim(), subject.trim()) {
            ("flat", "node") => Ok(Representation::Flat),
            ("tree", "node") => Ok(Representation::Tree),
            ("flat", "edge") => Ok(Representation::FlatEdge),
            ("tree", "edge") => Ok(Representation::TreeEdge),
            _ => Err(QueryError::Config(format!("unknown representation '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Comma separated public names, blank or `*` for all.
    pub select: String,
    pub filter: Option<String>,
    pub representation: Representation,
    pub distinct: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub roles: Vec<String>,
    pub ignore_null: bool,
    /// Bound of a built tree in MB, `0` for none.
    pub max_size_mb: usize,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            select: String::new(),
            filter: None,
            representation: Representation::Flat,
            distinct: false,
            limit: None,
            offset: None,
            roles: vec!["GUEST".to_string()],
            ignore_null: true,
            max_size_mb: 0,
        }
    }
}

/// Measurement time window; either bound switches to the history tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl TimeWindow {
    pub fn is_history(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }
}

/// A statement and, for tree representations, how to fold its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchQuery {
    pub statement: Statement,
    pub tree: Option<ResultBuilderConfig>,
}

impl FetchQuery {
    /// Normalize fetched rows and fold them when a tree was requested.
    pub fn build_result(&self, rows: Vec<Row>, schema: &Schema, ignore_null: bool) -> Result<serde_json::Value> {
        let rows = RowNormalizer::new(schema, ignore_null).normalize_all(rows);
        match &self.tree {
            Some(config) => build_tree(&rows, schema, config),
            None => Ok(serde_json::Value::Array(
                rows.into_iter().map(serde_json::Value::Object).collect(),
            )),
        }
    }
}

/// Split a comma separated list, dropping blanks and duplicates.
pub fn csv_to_set(list: &str) -> Vec<String> {
    let mut set: Vec<String> = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !set.iter().any(|s| s == item) {
            set.push(item.to_string());
        }
    }
    set
}

fn restricts(set: &[String]) -> bool {
    !set.iter().any(|s| s == "*")
}

fn string_list(set: &[String]) -> ParamValue {
    ParamValue::list(set.iter().cloned())
}

pub struct DataFetcher<'e> {
    engine: &'e SelectExpansion,
    request: FetchRequest,
}

impl<'e> DataFetcher<'e> {
    pub fn new(engine: &'e SelectExpansion, request: FetchRequest) -> Self {
        Self { engine, request }
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    fn expand(&self, scope: &[&str]) -> Result<Expansion> {
        self.engine
            .expand(&self.request.select, self.request.filter.as_deref(), scope)
    }

    fn tree(
        &self,
        entry_point: &str,
        hierarchy: &[&str],
        exit_point: Option<&str>,
    ) -> Option<ResultBuilderConfig> {
        if self.request.representation.is_flat() {
            return None;
        }
        let config = ResultBuilderConfig::new(entry_point, hierarchy, !self.request.ignore_null)
            .max_size_mb(self.request.max_size_mb);
        Some(match exit_point {
            Some(exit_point) => config.set_exit_point(exit_point),
            None => config,
        })
    }

    fn require_node(&self, method: &str) -> Result<()> {
        if self.request.representation.is_edge() {
            return Err(QueryError::EdgeRepresentation {
                method: method.to_string(),
            });
        }
        Ok(())
    }

    fn require_edge(&self, method: &str) -> Result<()> {
        if !self.request.representation.is_edge() {
            return Err(QueryError::NodeRepresentation {
                method: method.to_string(),
            });
        }
        Ok(())
    }

    pub fn fetch_station_types(&self) -> Result<FetchQuery> {
        self.require_node("fetch_station_types")?;
        Ok(FetchQuery {
            statement: Statement {
                sql: "select distinct stationtype as id from station order by 1".to_string(),
                params: Params::new(),
            },
            tree: None,
        })
    }

    pub fn fetch_edge_types(&self) -> Result<FetchQuery> {
        self.require_edge("fetch_edge_types")?;
        Ok(FetchQuery {
            statement: Statement {
                sql: "select distinct stationtype as id from edge e join station s on e.edge_data_id = s.id order by 1"
                    .to_string(),
                params: Params::new(),
            },
            tree: None,
        })
    }

    pub fn fetch_stations(&self, station_types: &[String]) -> Result<FetchQuery> {
        self.require_node("fetch_stations")?;
        let tree = !self.request.representation.is_flat();
        let expansion = self.expand(&STATION_SCOPE)?;

        let mut q = StatementBuilder::new(&expansion);
        q.add_sql("select")
            .add_sql_if("distinct", self.request.distinct)
            .add_sql_if(STATION_KEYS, tree)
            .expand_select_prefix(", ", tree)
            .add_sql("from station s")
            .add_sql_if_alias("left join metadata m on m.id = s.meta_data_id", "smetadata")
            .add_sql_if_definition("left join station p on s.parent_id = p.id", "parent")
            .add_sql_if_alias("left join metadata pm on pm.id = p.meta_data_id", "pmetadata")
            .add_sql("where true")
            .set_parameter_if_not_empty_and(
                "stationtypes",
                string_list(station_types),
                "and s.stationtype in (:stationtypes)",
                restricts(station_types),
            )
            .expand_where()
            .expand_group_by_if("_stationtype, _stationcode", tree)
            .order_by_if("_stationtype, _stationcode", tree)
            .add_limit(self.request.limit)
            .add_offset(self.request.offset);

        debug!(command = "fetch_stations", station_types = ?station_types, "statement ready");
        Ok(FetchQuery {
            statement: q.build()?,
            tree: self.tree("stationtype", &["_stationtype", "_stationcode"], Some("station")),
        })
    }

    /// Edges with their begin and end stations, restricted by the edge's
    /// own station type.
    pub fn fetch_edges(&self, station_types: &[String]) -> Result<FetchQuery> {
        self.require_edge("fetch_edges")?;
        let tree = !self.request.representation.is_flat();
        let expansion = self.expand(&EDGE_SCOPE)?;

        let mut q = StatementBuilder::new(&expansion);
        q.add_sql("select")
            .add_sql_if("distinct", self.request.distinct)
            .add_sql_if(EDGE_KEYS, tree)
            .expand_select_prefix(", ", tree)
            .add_sql_lines(&[
                "from edge e",
                "join station i on e.edge_data_id = i.id",
                "join station o on e.origin_id = o.id",
                "join station d on e.destination_id = d.id",
                "where true",
            ])
            .set_parameter_if_not_empty_and(
                "stationtypes",
                string_list(station_types),
                "and i.stationtype in (:stationtypes)",
                restricts(station_types),
            )
            .expand_where()
            .expand_group_by_if("_stationtype, _stationcode", tree)
            .order_by_if("_stationtype, _stationcode", tree)
            .add_limit(self.request.limit)
            .add_offset(self.request.offset);

        debug!(command = "fetch_edges", station_types = ?station_types, "statement ready");
        Ok(FetchQuery {
            statement: q.build()?,
            tree: self.tree("edgetype", &["_stationtype", "_stationcode"], Some("edge")),
        })
    }

    pub fn fetch_stations_and_types(
        &self,
        station_types: &[String],
        data_types: &[String],
    ) -> Result<FetchQuery> {
        self.require_node("fetch_stations_and_types")?;
        let expansion = self.expand(&STATION_TYPE_SCOPE)?;
        let branches = [(&expansion, "measurement"), (&expansion, "measurementstring")];
        let statement = self.union(&branches, station_types, data_types, None)?;

        debug!(command = "fetch_stations_and_types", station_types = ?station_types, data_types = ?data_types, "statement ready");
        Ok(FetchQuery {
            statement,
            tree: self.tree(
                "stationtype",
                &["_stationtype", "_stationcode", "_datatypename"],
                Some("datatype"),
            ),
        })
    }

    /// Latest measurements, or the history within `window` if it is bounded.
    pub fn fetch_measurements(
        &self,
        station_types: &[String],
        data_types: &[String],
        window: &TimeWindow,
    ) -> Result<FetchQuery> {
        self.require_node("fetch_measurements")?;
        let double = self.expand(&MEASUREMENT_DOUBLE_SCOPE)?;
        let (use_double, use_string) = match double.where_type_class("mvalue")? {
            None | Some(TypeClass::Null | TypeClass::ListNull) => (true, true),
            Some(TypeClass::Number | TypeClass::ListNumber) => (true, false),
            Some(TypeClass::String | TypeClass::ListString) => (false, true),
            Some(other) => {
                return Err(QueryError::TypeConflict {
                    alias: "mvalue".to_string(),
                    first: other.to_string(),
                    second: "null, number or string".to_string(),
                })
            }
        };
        let string = if use_string {
            Some(self.expand(&MEASUREMENT_STRING_SCOPE)?)
        } else {
            None
        };

        let history = window.is_history();
        let mut branches = Vec::with_capacity(2);
        if use_double {
            branches.push((&double, if history { "measurementhistory" } else { "measurement" }));
        }
        if let Some(string) = &string {
            branches.push((
                string,
                if history { "measurementstringhistory" } else { "measurementstring" },
            ));
        }
        let statement = self.union(&branches, station_types, data_types, Some(window))?;

        let command = if history {
            "fetch_measurement_history"
        } else {
            "fetch_measurement"
        };
        debug!(
            command,
            branches = branches.len(),
            "statement ready"
        );
        Ok(FetchQuery {
            statement,
            tree: self.tree(
                "stationtype",
                &["_stationtype", "_stationcode", "_datatypename"],
                None,
            ),
        })
    }

    /// One select per measurement table, joined with `union all`. A time
    /// window also enables the permission join and the role filter.
    fn union(
        &self,
        branches: &[(&Expansion, &str)],
        station_types: &[String],
        data_types: &[String],
        window: Option<&TimeWindow>,
    ) -> Result<Statement> {
        let Some(&(first, _)) = branches.first() else {
            return Err(QueryError::Config("no measurement table to query".to_string()));
        };
        let tree = !self.request.representation.is_flat();

        let mut q = StatementBuilder::new(first);
        for (i, &(expansion, table)) in branches.iter().enumerate() {
            if i > 0 {
                q.add_sql("union all");
            }
            q.reset(expansion)
                .add_sql("select")
                .add_sql_if("distinct", self.request.distinct)
                .add_sql_if(DATATYPE_KEYS, tree)
                .expand_select_prefix(", ", tree)
                .add_sql(&format!("from {} me", table));
            if window.is_some() {
                q.add_sql_lines(&[
                    "join bdppermissions pe on (",
                    "(me.station_id = pe.station_id or pe.station_id is null)",
                    "and (me.type_id = pe.type_id or pe.type_id is null)",
                    "and (me.period = pe.period or pe.period is null)",
                    "and pe.role_id in (select id from bdprole r where r.name in (:roles))",
                    ")",
                ]);
            }
            q.add_sql("join station s on me.station_id = s.id")
                .add_sql_if_alias("left join metadata m on m.id = s.meta_data_id", "smetadata")
                .add_sql_if_definition("left join station p on s.parent_id = p.id", "parent")
                .add_sql_if_alias("left join metadata pm on pm.id = p.meta_data_id", "pmetadata")
                .add_sql("join type t on me.type_id = t.id")
                .add_sql_if_alias("left join type_metadata tm on tm.id = t.meta_data_id", "tmetadata")
                .add_sql("where true")
                .set_parameter_if_not_empty_and(
                    "stationtypes",
                    string_list(station_types),
                    "and s.stationtype in (:stationtypes)",
                    restricts(station_types),
                )
                .set_parameter_if_not_empty_and(
                    "datatypes",
                    string_list(data_types),
                    "and t.cname in (:datatypes)",
                    restricts(data_types),
                );
            if let Some(window) = window {
                q.set_parameter_if_not_null(
                    "from",
                    window.from.clone().map(Value::from),
                    "and timestamp >= :from",
                )
                .set_parameter_if_not_null(
                    "to",
                    window.to.clone().map(Value::from),
                    "and timestamp < :to",
                )
                .set_parameter("roles", ParamValue::list(self.request.roles.iter().cloned()));
            }
            q.expand_where()
                .expand_group_by_if("_stationtype, _stationcode, _datatypename", tree);
        }
        q.order_by_if("_stationtype, _stationcode, _datatypename", tree)
            .add_limit(self.request.limit)
            .add_offset(self.request.offset);
        q.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaConfig;
    use sea_query::PostgresQueryBuilder;
    use serde_json::json;

    fn engine() -> SelectExpansion {
        SchemaConfig::default().build().unwrap()
    }

    fn request(select: &str, filter: Option<&str>, representation: Representation) -> FetchRequest {
        FetchRequest {
            select: select.to_string(),
            filter: filter.map(str::to_string),
            representation,
            ..FetchRequest::default()
        }
    }

    fn set(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_csv_to_set() {
        assert_eq!(csv_to_set(" a, b,,a ,c"), set(&["a", "b", "c"]));
        assert!(csv_to_set("").is_empty());
        assert!(!restricts(&csv_to_set("a,*")));
    }

    #[test]
    fn test_parse_representation() {
        assert_eq!("flat".parse::<Representation>().unwrap(), Representation::Flat);
        assert_eq!("tree,node".parse::<Representation>().unwrap(), Representation::Tree);
        assert_eq!("flat, edge".parse::<Representation>().unwrap(), Representation::FlatEdge);
        assert_eq!("tree,edge".parse::<Representation>().unwrap(), Representation::TreeEdge);
        assert!("tree,graph".parse::<Representation>().is_err());
        assert!(Representation::FlatEdge.is_flat());
        assert!(!Representation::Tree.is_edge());
    }

    #[test]
    fn test_fetch_stations_tree() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("sname", None, Representation::Tree));
        let query = fetcher.fetch_stations(&set(&["parking"])).unwrap();
        assert_eq!(
            query.statement.sql,
            "select\n\
             s.stationtype as _stationtype, s.stationcode as _stationcode\n\
             , s.name as sname\n\
             from station s\n\
             where true\n\
             and s.stationtype in (:stationtypes)\n\
             group by _stationtype, _stationcode, sname\n\
             order by _stationtype, _stationcode"
        );
        let tree = query.tree.unwrap();
        assert_eq!(tree.entry_point, "stationtype");
        assert_eq!(tree.hierarchy, set(&["_stationtype", "_stationcode"]));
        assert!(!tree.show_null);
        assert!(tree.exit_point("station").is_some_and(|e| e.include));
    }

    #[test]
    fn test_fetch_stations_flat_joins() {
        let engine = engine();
        let mut req = request("pname", Some("smetadata.city.eq.Bozen"), Representation::Flat);
        req.distinct = true;
        req.limit = Some(10);
        let fetcher = DataFetcher::new(&engine, req);
        let query = fetcher.fetch_stations(&set(&["*"])).unwrap();
        let sql = &query.statement.sql;

        assert!(sql.starts_with("select\ndistinct\np.name as pname\nfrom station s"));
        assert!(sql.contains("left join metadata m on m.id = s.meta_data_id"));
        assert!(sql.contains("left join station p on s.parent_id = p.id"));
        assert!(!sql.contains("metadata pm"));
        assert!(!sql.contains(":stationtypes"));
        assert!(sql.ends_with("limit :limit"));
        assert!(!sql.contains("group by"));
        assert!(query.tree.is_none());

        let (positional, values) = query.statement.to_positional(&PostgresQueryBuilder).unwrap();
        assert!(positional.contains("jsonb_extract_path_text(m.json, $1) = $2"));
        assert_eq!(values.0.len(), 3);
    }

    #[test]
    fn test_measurements_union_both_tables() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("mvalue, tname", None, Representation::Tree));
        let query = fetcher
            .fetch_measurements(&set(&["parking"]), &set(&["occupied"]), &TimeWindow::default())
            .unwrap();
        let sql = &query.statement.sql;

        assert!(sql.contains("from measurement me"));
        assert!(sql.contains("from measurementstring me"));
        assert_eq!(sql.matches("union all").count(), 1);
        assert!(sql.contains("me.double_value as mvalue, null::character varying as mvalue_string"));
        assert!(sql.contains("null::double precision as mvalue_double, me.string_value as mvalue"));
        assert_eq!(sql.matches("join bdppermissions pe").count(), 2);
        assert!(sql.contains(
            "\ngroup by _stationtype, _stationcode, _datatypename, mvalue, mvalue_string, tname\nunion all"
        ));
        assert!(sql.contains(
            "\ngroup by _stationtype, _stationcode, _datatypename, mvalue_double, mvalue, tname\norder by"
        ));
        assert!(sql.ends_with("order by _stationtype, _stationcode, _datatypename"));
        assert!(!sql.contains("timestamp"));

        let params = &query.statement.params;
        assert_eq!(
            params.get("roles"),
            Some(&ParamValue::list(["GUEST".to_string()]))
        );
        assert_eq!(
            params.get("datatypes"),
            Some(&ParamValue::list(["occupied".to_string()]))
        );
        assert!(query.statement.to_positional(&PostgresQueryBuilder).is_ok());
    }

    #[test]
    fn test_measurements_number_filter_uses_double_history() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("mvalue", Some("mvalue.gt.5"), Representation::Flat));
        let window = TimeWindow {
            from: Some("2020-01-01".to_string()),
            to: None,
        };
        let query = fetcher.fetch_measurements(&set(&["*"]), &set(&["*"]), &window).unwrap();
        let sql = &query.statement.sql;

        assert!(sql.contains("from measurementhistory me"));
        assert!(!sql.contains("measurementstring"));
        assert!(!sql.contains("union all"));
        assert!(sql.contains("and timestamp >= :from"));
        assert!(!sql.contains(":to"));
        assert!(sql.contains("and (me.double_value > :pwhere_0)"));
        assert!(!sql.contains("order by"));
        assert!(!sql.contains("group by"));
        assert_eq!(
            query.statement.params.get("from"),
            Some(&ParamValue::Scalar(Value::from("2020-01-01".to_string())))
        );
    }

    #[test]
    fn test_measurements_string_filter_uses_string_table() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("", Some("mvalue.in.(a,b)"), Representation::Flat));
        let query = fetcher
            .fetch_measurements(&set(&["*"]), &set(&["*"]), &TimeWindow::default())
            .unwrap();
        let sql = &query.statement.sql;
        assert!(sql.contains("from measurementstring me"));
        assert!(!sql.contains("from measurement me"));
        assert!(sql.contains("me.string_value in (:pwhere_0)"));
    }

    #[test]
    fn test_measurements_reject_other_value_types() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("mvalue", Some("mvalue.eq.true"), Representation::Flat));
        let err = fetcher
            .fetch_measurements(&set(&["*"]), &set(&["*"]), &TimeWindow::default())
            .unwrap_err();
        assert_eq!(err.code(), "WHERE_WRONG_DATA_TYPE");
    }

    #[test]
    fn test_stations_and_types() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("sname, tname", None, Representation::Tree));
        let query = fetcher.fetch_stations_and_types(&set(&["*"]), &set(&["*"])).unwrap();
        let sql = &query.statement.sql;
        assert!(sql.contains("from measurement me"));
        assert!(sql.contains("from measurementstring me"));
        assert!(!sql.contains("bdppermissions"));
        assert!(!sql.contains("left join station p"));
        assert!(query.statement.params.is_empty());

        // not in scope here
        let fetcher = DataFetcher::new(&engine, request("sname", Some("mvalue.eq.1"), Representation::Flat));
        let err = fetcher.fetch_stations_and_types(&[], &[]).unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_INSIDE_DEFLIST");
    }

    #[test]
    fn test_station_types() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, FetchRequest::default());
        let query = fetcher.fetch_station_types().unwrap();
        assert_eq!(query.statement.sql, "select distinct stationtype as id from station order by 1");
        assert!(query.statement.params.is_empty());
    }

    #[test]
    fn test_fetch_edges_flat() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("ename, sbname", None, Representation::FlatEdge));
        let query = fetcher.fetch_edges(&set(&["linkstation"])).unwrap();
        assert_eq!(
            query.statement.sql,
            "select\n\
             i.name as ename, o.name as sbname\n\
             from edge e\n\
             join station i on e.edge_data_id = i.id\n\
             join station o on e.origin_id = o.id\n\
             join station d on e.destination_id = d.id\n\
             where true\n\
             and i.stationtype in (:stationtypes)"
        );
        assert_eq!(
            query.statement.params.get("stationtypes"),
            Some(&ParamValue::list(["linkstation".to_string()]))
        );
        assert!(query.tree.is_none());
    }

    #[test]
    fn test_fetch_edges_tree() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("", Some("ename.eq.x"), Representation::TreeEdge));
        let query = fetcher.fetch_edges(&set(&["*"])).unwrap();
        let sql = &query.statement.sql;
        assert!(sql.starts_with(
            "select\ni.stationtype as _stationtype, i.stationcode as _stationcode\n, i.name as ename"
        ));
        assert!(sql.contains("o.name as sbname"));
        assert!(sql.contains("d.name as sename"));
        assert!(sql.contains("\nand (i.name = :pwhere_0)\ngroup by _stationtype, _stationcode, ename, etype"));
        assert!(sql.ends_with("order by _stationtype, _stationcode"));
        assert!(!sql.contains(":stationtypes"));

        let tree = query.tree.clone().unwrap();
        assert_eq!(tree.entry_point, "edgetype");
        assert!(tree.exit_point("edge").is_some());

        let rows = vec![json!({"_stationtype": "linkstation", "_stationcode": "a-b",
                               "ename": "A-B", "sbname": "A", "sename": "B"})]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        let result = query.build_result(rows, engine.schema(), true).unwrap();
        assert_eq!(
            result,
            json!({"linkstation": {"edges": {"a-b": {"ename": "A-B", "sbname": "A", "sename": "B"}}}})
        );
    }

    #[test]
    fn test_edge_types() {
        let engine = engine();
        let fetcher = DataFetcher::new(&engine, request("", None, Representation::TreeEdge));
        let query = fetcher.fetch_edge_types().unwrap();
        assert_eq!(
            query.statement.sql,
            "select distinct stationtype as id from edge e join station s on e.edge_data_id = s.id order by 1"
        );
    }

    #[test]
    fn test_representation_mismatch() {
        let engine = engine();
        for representation in [Representation::FlatEdge, Representation::TreeEdge] {
            let fetcher = DataFetcher::new(&engine, request("", None, representation));
            let window = TimeWindow::default();
            let errors = [
                fetcher.fetch_stations(&[]).unwrap_err(),
                fetcher.fetch_stations_and_types(&[], &[]).unwrap_err(),
                fetcher.fetch_measurements(&[], &[], &window).unwrap_err(),
                fetcher.fetch_station_types().unwrap_err(),
            ];
            for err in errors {
                assert_eq!(err.code(), "METHOD_NOT_ALLOWED_FOR_EDGE_REPR");
            }
        }

        for representation in [Representation::Flat, Representation::Tree] {
            let fetcher = DataFetcher::new(&engine, request("", None, representation));
            match fetcher.fetch_edges(&[]) {
                Err(QueryError::NodeRepresentation { method }) => assert_eq!(method, "fetch_edges"),
                other => panic!("Expected NodeRepresentation, got {:?}", other),
            }
            assert_eq!(
                fetcher.fetch_edge_types().unwrap_err().code(),
                "METHOD_NOT_ALLOWED_FOR_NODE_REPR"
            );
        }
    }

    #[test]
    fn test_tree_size_bound() {
        let engine = engine();
        let mut req = request("sname", None, Representation::Tree);
        req.max_size_mb = 1;
        let query = DataFetcher::new(&engine, req).fetch_stations(&[]).unwrap();
        assert_eq!(query.tree.as_ref().map(|t| t.max_size_mb), Some(1));

        let big = "x".repeat(700_000);
        let rows: Vec<Row> = ["a", "b"]
            .iter()
            .map(|code| json!({"_stationtype": "parking", "_stationcode": code, "sname": big.as_str()}))
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let err = query.build_result(rows, engine.schema(), true).unwrap_err();
        assert_eq!(err.code(), "RESPONSE_SIZE_EXCEEDED");
    }

    #[test]
    fn test_build_result() {
        let engine = engine();
        let rows: Vec<Row> = [
            json!({"_stationtype": "parking", "_stationcode": "a", "_datatypename": "free",
                   "sname": "A", "tname": "free", "mvalue": 3.0, "mvalue_string": null}),
            json!({"_stationtype": "parking", "_stationcode": "a", "_datatypename": "state",
                   "sname": "A", "tname": "state", "mvalue_double": null, "mvalue": "open"}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();

        let fetcher = DataFetcher::new(&engine, request("", None, Representation::Tree));
        let query = fetcher
            .fetch_measurements(&[], &[], &TimeWindow::default())
            .unwrap();
        let tree = query.build_result(rows.clone(), engine.schema(), true).unwrap();
        let station = &tree["parking"]["stations"]["a"];
        assert_eq!(station["sname"], json!("A"));
        assert_eq!(station["sdatatypes"]["free"]["tmeasurements"][0]["mvalue"], json!(3.0));
        assert_eq!(station["sdatatypes"]["state"]["tmeasurements"][0]["mvalue"], json!("open"));

        let fetcher = DataFetcher::new(&engine, request("", None, Representation::Flat));
        let query = fetcher
            .fetch_measurements(&[], &[], &TimeWindow::default())
            .unwrap();
        let flat = query.build_result(rows, engine.schema(), true).unwrap();
        assert_eq!(flat.as_array().unwrap().len(), 2);
        assert_eq!(flat[1]["mvalue"], json!("open"));
        assert!(flat[0].get("mvalue_string").is_none());
    }
}
