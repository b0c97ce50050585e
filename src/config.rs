//! 配置模块，负责加载实体定义与操作符的JSON配置

use crate::error::{QueryError, Result};
use crate::expansion::SelectExpansion;
use crate::operator::{OperatorRegistry, TypeClass, Validator};
use crate::schema::{LookUpType, Schema, TargetDef, TargetDefList};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// 进程内唯一的查询引擎
static ENGINE: OnceCell<SelectExpansion> = OnceCell::new();

/// 字段配置：`sql` 与 `nested` 二选一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// 嵌套实体名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookUpType>,
}

impl FieldConfig {
    pub fn column(name: &str, sql: &str) -> Self {
        Self {
            name: name.to_string(),
            sql: Some(sql.to_string()),
            sql_before: None,
            sql_after: None,
            alias: None,
            nested: None,
            lookup: None,
        }
    }

    pub fn nested(name: &str, target: &str, lookup: LookUpType) -> Self {
        Self {
            name: name.to_string(),
            sql: None,
            sql_before: None,
            sql_after: None,
            alias: None,
            nested: Some(target.to_string()),
            lookup: Some(lookup),
        }
    }

    fn to_target_def(&self, entity: &str) -> Result<TargetDef> {
        let mut def = match (&self.sql, &self.nested) {
            (Some(sql), None) => {
                let mut def = TargetDef::column(&self.name, sql);
                if let Some(before) = &self.sql_before {
                    def = def.sql_before(before);
                }
                if let Some(after) = &self.sql_after {
                    def = def.sql_after(after);
                }
                def
            }
            // 未指定 lookup 时默认内联
            (None, Some(target)) => {
                TargetDef::nested(&self.name, target, self.lookup.unwrap_or(LookUpType::Inline))
            }
            _ => {
                return Err(QueryError::Config(format!(
                    "字段 {}.{} 必须且只能指定 sql 或 nested 之一",
                    entity, self.name
                )))
            }
        };
        if let Some(alias) = &self.alias {
            def = def.alias(alias);
        }
        Ok(def)
    }
}

/// 实体定义配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    pub fields: Vec<FieldConfig>,
}

/// 操作符配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// 例如 "number"、"list/string"
    pub type_class: String,
    pub name: String,
    pub template: String,
    /// 允许的值个数，为空则不校验
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arity: Option<Vec<usize>>,
}

fn default_true() -> bool {
    true
}

/// 查询引擎配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub entities: Vec<EntityConfig>,
    /// 是否预先注册内置操作符
    #[serde(default = "default_true")]
    pub standard_operators: bool,
    /// 追加或覆盖的操作符
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
}

impl SchemaConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(QueryError::Config(format!(
                "配置文件不存在: {}",
                path_ref.display()
            )));
        }

        // 读取文件内容
        let content = fs::read_to_string(path_ref).map_err(|e| {
            QueryError::Config(format!("无法读取配置文件 {}: {}", path_ref.display(), e))
        })?;

        Self::from_json_str(&content).map_err(|e| match e {
            QueryError::Config(message) => {
                QueryError::Config(format!("{} ({})", message, path_ref.display()))
            }
            other => other,
        })
    }

    /// 解析JSON字符串
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| QueryError::Config(format!("无法解析JSON配置: {}", e)))
    }

    /// 构建实体定义注册表，并检查嵌套引用
    pub fn to_schema(&self) -> Result<Schema> {
        let mut schema = Schema::new();
        for entity in &self.entities {
            let mut list = TargetDefList::new(&entity.name);
            for field in &entity.fields {
                list.push(field.to_target_def(&entity.name)?);
            }
            schema.add(list)?;
        }
        schema.validate()?;
        Ok(schema)
    }

    /// 构建操作符注册表
    pub fn to_registry(&self) -> Result<OperatorRegistry> {
        let mut registry = if self.standard_operators {
            OperatorRegistry::standard()?
        } else {
            OperatorRegistry::new()
        };
        for op in &self.operators {
            let class: TypeClass = op.type_class.parse()?;
            match &op.arity {
                Some(arity) => registry.add_with_validator(
                    class,
                    &op.name,
                    &op.template,
                    Validator::Arity(arity.clone()),
                )?,
                None => registry.add(class, &op.name, &op.template)?,
            }
        }
        Ok(registry)
    }

    /// 构建查询引擎
    pub fn build(&self) -> Result<SelectExpansion> {
        let schema = self.to_schema()?;
        let registry = self.to_registry()?;
        debug!(
            entities = self.entities.len(),
            operators = registry.len(),
            "schema config loaded"
        );
        SelectExpansion::new(schema, registry)
    }
}

impl Default for SchemaConfig {
    /// 内置的测站 / 数据类型 / 测量值目录
    fn default() -> Self {
        use LookUpType::{Inline, List, Map};

        let entity = |name: &str, fields: Vec<FieldConfig>| EntityConfig {
            name: name.to_string(),
            fields,
        };
        let mut mvalue_double = FieldConfig::column("mvalue_double", "me.double_value");
        mvalue_double.sql_after = Some("null::character varying as mvalue_string".to_string());
        mvalue_double.alias = Some("mvalue".to_string());
        let mut mvalue_string = FieldConfig::column("mvalue_string", "me.string_value");
        mvalue_string.sql_before = Some("null::double precision as mvalue_double".to_string());
        mvalue_string.alias = Some("mvalue".to_string());

        let entities = vec![
            entity(
                "stationtype",
                vec![FieldConfig::nested("stations", "station", Map)],
            ),
            entity(
                "station",
                vec![
                    FieldConfig::column("sname", "s.name"),
                    FieldConfig::column("stype", "s.stationtype"),
                    FieldConfig::column("scode", "s.stationcode"),
                    FieldConfig::column("sorigin", "s.origin"),
                    FieldConfig::column("sactive", "s.active"),
                    FieldConfig::column("savailable", "s.available"),
                    FieldConfig::column("scoordinate", "s.pointprojection"),
                    FieldConfig::column("smetadata", "m.json"),
                    FieldConfig::nested("sparent", "parent", Inline),
                    FieldConfig::nested("sdatatypes", "datatype", Map),
                ],
            ),
            entity(
                "parent",
                vec![
                    FieldConfig::column("pname", "p.name"),
                    FieldConfig::column("ptype", "p.stationtype"),
                    FieldConfig::column("pcode", "p.stationcode"),
                    FieldConfig::column("porigin", "p.origin"),
                    FieldConfig::column("pactive", "p.active"),
                    FieldConfig::column("pavailable", "p.available"),
                    FieldConfig::column("pcoordinate", "p.pointprojection"),
                    FieldConfig::column("pmetadata", "pm.json"),
                ],
            ),
            entity(
                "datatype",
                vec![
                    FieldConfig::column("tname", "t.cname"),
                    FieldConfig::column("tunit", "t.cunit"),
                    FieldConfig::column("ttype", "t.rtype"),
                    FieldConfig::column("tdescription", "t.description"),
                    FieldConfig::column("tmetadata", "tm.json"),
                    FieldConfig::nested("tmeasurements", "measurement", List),
                ],
            ),
            entity(
                "measurement",
                vec![
                    FieldConfig::column("mvalidtime", "me.timestamp"),
                    FieldConfig::column("mtransactiontime", "me.created_on"),
                    FieldConfig::column("mperiod", "me.period"),
                ],
            ),
            entity("measurementdouble", vec![mvalue_double]),
            entity("measurementstring", vec![mvalue_string]),
            // 边：i 是边自身的测站记录，o / d 是起点和终点
            entity("edgetype", vec![FieldConfig::nested("edges", "edge", Map)]),
            entity(
                "edge",
                vec![
                    FieldConfig::column("ename", "i.name"),
                    FieldConfig::column("etype", "i.stationtype"),
                    FieldConfig::column("ecode", "i.stationcode"),
                    FieldConfig::column("eorigin", "i.origin"),
                    FieldConfig::column("eactive", "i.active"),
                    FieldConfig::column("eavailable", "i.available"),
                    FieldConfig::column("edirected", "e.directed"),
                    FieldConfig::column("eline", "e.linegeometry"),
                    FieldConfig::nested("ebegin", "stationbegin", Inline),
                    FieldConfig::nested("eend", "stationend", Inline),
                ],
            ),
            entity(
                "stationbegin",
                vec![
                    FieldConfig::column("sbname", "o.name"),
                    FieldConfig::column("sbtype", "o.stationtype"),
                    FieldConfig::column("sbcode", "o.stationcode"),
                    FieldConfig::column("sborigin", "o.origin"),
                    FieldConfig::column("sbactive", "o.active"),
                    FieldConfig::column("sbavailable", "o.available"),
                    FieldConfig::column("sbcoordinate", "o.pointprojection"),
                ],
            ),
            entity(
                "stationend",
                vec![
                    FieldConfig::column("sename", "d.name"),
                    FieldConfig::column("setype", "d.stationtype"),
                    FieldConfig::column("secode", "d.stationcode"),
                    FieldConfig::column("seorigin", "d.origin"),
                    FieldConfig::column("seactive", "d.active"),
                    FieldConfig::column("seavailable", "d.available"),
                    FieldConfig::column("secoordinate", "d.pointprojection"),
                ],
            ),
        ];

        Self {
            entities,
            standard_operators: true,
            operators: Vec::new(),
        }
    }
}

/// 安装进程内的查询引擎，初始化函数只执行一次，之后返回已安装的引擎
pub fn setup<F>(init: F) -> Result<&'static SelectExpansion>
where
    F: FnOnce() -> Result<SelectExpansion>,
{
    ENGINE.get_or_try_init(init)
}

/// 获取已安装的查询引擎
pub fn engine() -> Result<&'static SelectExpansion> {
    ENGINE
        .get()
        .ok_or_else(|| QueryError::Config("查询引擎尚未初始化".to_string()))
}
